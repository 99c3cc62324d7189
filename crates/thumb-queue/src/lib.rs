//! Redis Streams job bus.
//!
//! This crate provides:
//! - Job consumption with consumer groups, ack, pending-claim and DLQ
//! - Job publishing for the backfill
//! - Lifecycle and completion event streams
//! - Per-parent leases

pub mod error;
pub mod events;
pub mod lease;
pub mod memory;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use events::{EventPublisher, RedisEventPublisher, EVENT_FIELD};
pub use lease::{MemoryLease, NoopLease, ParentLease, RedisLease};
pub use memory::{RecordingEventPublisher, RecordingJobPublisher};
pub use queue::{Delivery, JobPublisher, JobQueue, QueueConfig, PAYLOAD_FIELD};

//! Thumbnail worker.
//!
//! This crate provides:
//! - Job pipeline: validate, create placeholders, fetch, render, upload
//! - Derived record lifecycle management
//! - Job executor with bounded concurrency, crash recovery and dead-lettering
//! - Reconciliation scanner for gap-filling and status repair
//! - Graceful shutdown

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod reconcile;
pub mod records;
pub mod source;

pub use config::WorkerConfig;
pub use error::{PipelineFailure, WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use logging::{init_tracing, JobLogger};
pub use pipeline::{Pipeline, PipelineSettings};
pub use reconcile::{
    DerivedSource, GapFill, GapFillStats, ParentSource, RepairStats, ScanOptions, ScanResult, Scanner,
    StatusRepair,
};
pub use records::DerivedRecordManager;
pub use source::SourceFetcher;

//! Content store client.
//!
//! This crate provides:
//! - The [`ContentStore`] collaborator trait
//! - A REST client with retry, tracing spans and request metrics
//! - An in-memory store for tests and local runs

pub mod client;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod retry;
pub mod store;

#[cfg(test)]
mod client_tests;

pub use client::{ContentClient, ContentConfig};
pub use error::{ContentError, ContentResult};
pub use memory::MemoryContentStore;
pub use retry::RetryConfig;
pub use store::{ContentFilter, ContentStore, DerivedFilter, NewDerived, Page, PageRequest};

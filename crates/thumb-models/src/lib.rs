//! Shared data models for the thumbnail worker.
//!
//! This crate contains:
//! - Inbound job envelope and its strict parse into [`ThumbnailJob`]
//! - Named size specs and deterministic variant naming
//! - Parent and derived content records with their separate lifecycles
//! - Lifecycle and completion events with the failure taxonomy

pub mod content;
pub mod events;
pub mod job;
pub mod size;

pub use content::{
    ContentId, ContentMetadata, DerivedRecord, DerivedStatus, InvalidTransition, ObjectInfo,
    ObjectStatus, ParentAsset, ParentStatus, THUMBNAIL_DERIVATION,
};
pub use events::{
    CompletionEvent, DerivationParams, FailureClass, LifecycleEvent, ProcessingStage,
    ResultStatus, ThumbnailResult,
};
pub use job::{
    FileRef, JobEnvelope, JobId, JobParseError, ThumbnailJob, ATTR_CONTENT_ID, ATTR_FILENAME,
    HINT_FILENAME, HINT_THUMBNAIL_SIZES,
};
pub use size::{
    split_size_names, variant_name, SizeCatalog, SizeParseError, SizeSpec, DEFAULT_SIZES,
    VARIANT_PREFIX,
};

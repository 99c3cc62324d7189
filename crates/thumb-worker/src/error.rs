//! Worker error types and failure classification.

use std::io::ErrorKind;
use std::time::Duration;

use thiserror::Error;

use thumb_content::ContentError;
use thumb_media::MediaError;
use thumb_models::{ContentId, FailureClass, InvalidTransition, JobParseError, ParentStatus};
use thumb_queue::QueueError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid job: {0}")]
    InvalidJob(#[from] JobParseError),

    #[error("Parent {id} is not available (status: {status})")]
    ParentNotReady { id: ContentId, status: ParentStatus },

    #[error("Parent {0} is leased by another job")]
    LeaseHeld(ContentId),

    #[error("Job exceeded its deadline of {}s", .0.as_secs())]
    DeadlineExceeded(Duration),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Content store error: {0}")]
    Content(#[from] ContentError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Status error: {0}")]
    Transition(#[from] InvalidTransition),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn upload_failed(msg: impl Into<String>) -> Self {
        Self::UploadFailed(msg.into())
    }

    /// Classify this error, using `unknown` when nothing matches.
    pub fn classify(&self, unknown: FailureClass) -> FailureClass {
        match self {
            WorkerError::InvalidJob(_) | WorkerError::ParentNotReady { .. } => FailureClass::Validation,
            WorkerError::LeaseHeld(_) | WorkerError::DeadlineExceeded(_) => FailureClass::Retryable,
            WorkerError::Config(_) | WorkerError::Transition(_) => FailureClass::Permanent,
            WorkerError::UploadFailed(msg) => classify_message(msg, unknown),
            WorkerError::Content(e) => classify_content(e, unknown),
            WorkerError::Media(e) => classify_media(e, unknown),
            WorkerError::Queue(e) if e.is_retryable() => FailureClass::Retryable,
            WorkerError::Queue(e) => classify_message(&e.to_string(), unknown),
            WorkerError::Io(e) => classify_io(e, unknown),
        }
    }
}

fn classify_content(err: &ContentError, unknown: FailureClass) -> FailureClass {
    if err.is_retryable() {
        return FailureClass::Retryable;
    }
    match err {
        ContentError::NotFound(_)
        | ContentError::PermissionDenied(_)
        | ContentError::AlreadyExists(_)
        | ContentError::Config(_)
        | ContentError::Json(_) => FailureClass::Permanent,
        ContentError::RequestFailed(_) if err.http_status().is_some_and(|s| (400..500).contains(&s)) => {
            FailureClass::Permanent
        }
        ContentError::Io(e) => classify_io(e, unknown),
        other => classify_message(&other.to_string(), unknown),
    }
}

fn classify_media(err: &MediaError, unknown: FailureClass) -> FailureClass {
    match err {
        MediaError::Timeout(_) => FailureClass::Retryable,
        MediaError::ToolNotFound(_)
        | MediaError::FileNotFound(_)
        | MediaError::UnsupportedFormat(_)
        | MediaError::InvalidSource(_)
        | MediaError::NoOutput(_)
        | MediaError::Image(_)
        | MediaError::JsonParse(_) => FailureClass::Permanent,
        MediaError::Io(e) => classify_io(e, unknown),
        MediaError::CommandFailed { .. } | MediaError::Internal(_) => classify_message(&err.diagnostic(), unknown),
    }
}

fn classify_io(err: &std::io::Error, unknown: FailureClass) -> FailureClass {
    match err.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidData => FailureClass::Permanent,
        ErrorKind::TimedOut
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock => FailureClass::Retryable,
        _ => classify_message(&err.to_string(), unknown),
    }
}

const PERMANENT_SIGNATURES: &[&str] = &[
    "invalid data found",
    "unsupported",
    "no such file",
    "not found",
    "permission denied",
    "invalid argument",
    "corrupt",
    "malformed",
    "moov atom not found",
    "syntax error",
    "may not be a pdf",
];

const TRANSIENT_SIGNATURES: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "broken pipe",
    "temporarily unavailable",
    "too many requests",
    "service unavailable",
    "bad gateway",
    "try again",
    "resource busy",
    "out of memory",
];

/// Pattern-match untyped error text against known signatures.
pub fn classify_message(message: &str, unknown: FailureClass) -> FailureClass {
    let msg = message.to_lowercase();

    if TRANSIENT_SIGNATURES.iter().any(|sig| msg.contains(sig)) {
        return FailureClass::Retryable;
    }
    if PERMANENT_SIGNATURES.iter().any(|sig| msg.contains(sig)) {
        return FailureClass::Permanent;
    }
    unknown
}

/// A classified pipeline failure, returned to the executor and emitted as an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class} failure: {message}")]
pub struct PipelineFailure {
    pub class: FailureClass,
    pub message: String,
}

impl PipelineFailure {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn from_error(err: &WorkerError, unknown: FailureClass) -> Self {
        Self::new(err.classify(unknown), err.to_string())
    }
}

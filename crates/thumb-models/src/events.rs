//! Lifecycle and completion events published by the pipeline.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::content::{ContentId, ParentStatus};
use crate::job::JobId;

/// Pipeline stage reported by a lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Validation,
    Processing,
    Upload,
    Completed,
    Failed,
}

impl ProcessingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStage::Validation => "validation",
            ProcessingStage::Processing => "processing",
            ProcessingStage::Upload => "upload",
            ProcessingStage::Completed => "completed",
            ProcessingStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStage::Completed | ProcessingStage::Failed)
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error taxonomy tag attached to every pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Malformed job or unmet prerequisite; never retried automatically
    Validation,
    /// Transient; safe to redeliver
    Retryable,
    /// Redelivery will not help
    Permanent,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Validation => "validation",
            FailureClass::Retryable => "retryable",
            FailureClass::Permanent => "permanent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "validation" => Some(FailureClass::Validation),
            "retryable" => Some(FailureClass::Retryable),
            "permanent" => Some(FailureClass::Permanent),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureClass::Retryable)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parameters needed to reproduce a rendition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DerivationParams {
    pub source_width: u32,
    pub source_height: u32,
    pub target_width: u32,
    pub target_height: u32,
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    pub processing_time_ms: u64,
    pub generated_at: DateTime<Utc>,
}

/// Outcome of one requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Processed,
    Failed,
}

/// Per-size entry of a completion event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ThumbnailResult {
    /// Size name from the catalogue
    pub size: String,
    pub content_id: ContentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    pub width: u32,
    pub height: u32,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_params: Option<DerivationParams>,
}

/// A single stage transition of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LifecycleEvent {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_content_id: Option<ContentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_status: Option<ParentStatus>,
    pub stage: ProcessingStage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thumbnail_sizes: Vec<String>,
    pub processing_start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<FailureClass>,
    /// Non-fatal condition worth surfacing (e.g. renderer fallback)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub happened_at: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(job_id: JobId, stage: ProcessingStage, processing_start: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            parent_content_id: None,
            parent_status: None,
            stage,
            thumbnail_sizes: Vec::new(),
            processing_start,
            processing_end: stage.is_terminal().then_some(now),
            error: None,
            failure_type: None,
            warning: None,
            happened_at: now,
        }
    }

    pub fn with_parent(mut self, id: Option<ContentId>, status: Option<ParentStatus>) -> Self {
        self.parent_content_id = id;
        self.parent_status = status;
        self
    }

    pub fn with_sizes(mut self, sizes: Vec<String>) -> Self {
        self.thumbnail_sizes = sizes;
        self
    }

    pub fn with_failure(mut self, class: FailureClass, error: impl Into<String>) -> Self {
        self.failure_type = Some(class);
        self.error = Some(error.into());
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }
}

/// Aggregate outcome of one job attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CompletionEvent {
    /// Job id
    pub id: JobId,
    pub source_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_content_id: Option<ContentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_status: Option<ParentStatus>,
    pub total_processed: usize,
    pub total_failed: usize,
    pub processing_time_ms: u64,
    #[serde(default)]
    pub results: Vec<ThumbnailResult>,
    #[serde(default)]
    pub lifecycle: Vec<LifecycleEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<FailureClass>,
    pub happened_at: DateTime<Utc>,
}

impl CompletionEvent {
    /// Build an event, deriving the aggregate counts from `results`.
    pub fn new(id: JobId, source_path: impl Into<String>, results: Vec<ThumbnailResult>) -> Self {
        let total_processed = results
            .iter()
            .filter(|r| r.status == ResultStatus::Processed)
            .count();
        let total_failed = results.len() - total_processed;
        Self {
            id,
            source_path: source_path.into(),
            parent_content_id: None,
            parent_status: None,
            total_processed,
            total_failed,
            processing_time_ms: 0,
            results,
            lifecycle: Vec::new(),
            error: None,
            failure_type: None,
            happened_at: Utc::now(),
        }
    }

    /// Some sizes failed while others succeeded.
    pub fn is_partial(&self) -> bool {
        self.total_failed > 0 && self.total_processed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(size: &str, status: ResultStatus) -> ThumbnailResult {
        ThumbnailResult {
            size: size.into(),
            content_id: ContentId::new(),
            object_id: None,
            width: 10,
            height: 10,
            status,
            error: None,
            derivation_params: None,
        }
    }

    #[test]
    fn test_completion_counts() {
        let event = CompletionEvent::new(
            JobId::from_string("job"),
            "in.png",
            vec![
                result("small", ResultStatus::Processed),
                result("medium", ResultStatus::Failed),
                result("large", ResultStatus::Processed),
            ],
        );
        assert_eq!(event.total_processed, 2);
        assert_eq!(event.total_failed, 1);
        assert!(event.is_partial());
    }

    #[test]
    fn test_lifecycle_terminal_sets_end() {
        let start = Utc::now();
        let event = LifecycleEvent::new(JobId::from_string("j"), ProcessingStage::Upload, start);
        assert!(event.processing_end.is_none());
        let event = LifecycleEvent::new(JobId::from_string("j"), ProcessingStage::Failed, start)
            .with_failure(FailureClass::Permanent, "boom");
        assert!(event.processing_end.is_some());
        assert_eq!(event.failure_type, Some(FailureClass::Permanent));
    }

    #[test]
    fn test_wire_field_names() {
        let event = LifecycleEvent::new(JobId::from_string("j"), ProcessingStage::Failed, Utc::now())
            .with_failure(FailureClass::Retryable, "timeout");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["stage"], "failed");
        assert_eq!(value["failure_type"], "retryable");
        assert!(value.get("warning").is_none());
    }

    #[test]
    fn test_failure_class_parse() {
        assert_eq!(FailureClass::parse(" Permanent "), Some(FailureClass::Permanent));
        assert_eq!(FailureClass::parse("nope"), None);
        assert!(FailureClass::Retryable.is_retryable());
        assert!(!FailureClass::Validation.is_retryable());
    }
}

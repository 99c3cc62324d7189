//! Content-store records: parent assets, derived renditions and their
//! two independent status lifecycles.

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Derivation type recorded on thumbnail renditions.
pub const THUMBNAIL_DERIVATION: &str = "thumbnail";

/// Identifier of a content-store record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Generate a new random content ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse a content ID, rejecting blanks and non-UUID values.
    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        Uuid::parse_str(trimmed)
            .ok()
            .map(|u| Self(u.hyphenated().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ContentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of an uploaded parent asset.
///
/// Unrelated to [`DerivedStatus`]; a parent is only ever `created` then `uploaded`
/// from this worker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParentStatus {
    Created,
    Uploaded,
    Failed,
    Deleted,
    #[serde(other)]
    Unknown,
}

impl ParentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParentStatus::Created => "created",
            ParentStatus::Uploaded => "uploaded",
            ParentStatus::Failed => "failed",
            ParentStatus::Deleted => "deleted",
            ParentStatus::Unknown => "unknown",
        }
    }

    /// Bytes are fully available and derivation may proceed.
    pub fn is_available(&self) -> bool {
        matches!(self, ParentStatus::Uploaded)
    }
}

impl fmt::Display for ParentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a derived rendition.
///
/// ```text
/// created ──> processing ──> processed
///    │            │  ▲           │
///    └──> failed <┘  └── failed  └──> deleted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DerivedStatus {
    Created,
    Processing,
    Processed,
    Failed,
    Deleted,
}

impl DerivedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DerivedStatus::Created => "created",
            DerivedStatus::Processing => "processing",
            DerivedStatus::Processed => "processed",
            DerivedStatus::Failed => "failed",
            DerivedStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(DerivedStatus::Created),
            "processing" => Some(DerivedStatus::Processing),
            "processed" => Some(DerivedStatus::Processed),
            "failed" => Some(DerivedStatus::Failed),
            "deleted" => Some(DerivedStatus::Deleted),
            _ => None,
        }
    }

    /// Generation has not finished yet.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, DerivedStatus::Created | DerivedStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DerivedStatus::Processed | DerivedStatus::Deleted)
    }

    /// Whether `self -> next` is an allowed edge.
    pub fn can_transition_to(&self, next: DerivedStatus) -> bool {
        use DerivedStatus::*;
        matches!(
            (self, next),
            (Created, Processing)
                | (Created, Failed)
                | (Processing, Processed)
                | (Processing, Failed)
                | (Failed, Processing)
                | (Processed, Deleted)
                | (Failed, Deleted)
        )
    }

    /// Validate a transition, returning the new status.
    pub fn transition(&self, next: DerivedStatus) -> Result<DerivedStatus, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl fmt::Display for DerivedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rejected derived-status edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid derived status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: DerivedStatus,
    pub to: DerivedStatus,
}

/// Parent asset as returned by the content store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParentAsset {
    pub id: ContentId,
    pub status: ParentStatus,
    /// Stored filename, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Empty for original uploads; set for derived content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ParentAsset {
    /// Derived content is never itself a thumbnail source.
    pub fn is_derived(&self) -> bool {
        self.derivation_type
            .as_deref()
            .is_some_and(|t| !t.is_empty())
    }
}

/// Descriptive metadata for a content record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ContentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    /// Free-form extension data (derivation parameters live here)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

/// One rendition record linked to a parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DerivedRecord {
    pub content_id: ContentId,
    pub parent_id: ContentId,
    /// Deterministic variant name, e.g. `thumbnail_512`
    pub variant: String,
    pub derivation_type: String,
    pub status: DerivedStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DerivedRecord {
    /// In flight for longer than `threshold` as of `now`.
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.status.is_in_flight() && now.signed_duration_since(self.updated_at) > threshold
    }
}

/// Upload state of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStatus {
    Pending,
    Uploaded,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Object (blob) backing a content record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ObjectInfo {
    pub object_id: String,
    pub content_id: ContentId,
    pub status: ObjectStatus,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ObjectInfo {
    pub fn is_uploaded(&self) -> bool {
        self.status == ObjectStatus::Uploaded
    }
}

//! Inbound job envelope and its strictly parsed form.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::content::ContentId;
use crate::size::split_size_names;

/// Hint key selecting a subset of the configured sizes.
pub const HINT_THUMBNAIL_SIZES: &str = "thumbnail_sizes";

/// Hint key overriding the output filename stem.
pub const HINT_FILENAME: &str = "filename";

/// Attribute key carrying the parent content identifier.
pub const ATTR_CONTENT_ID: &str = "content_id";

/// Attribute key carrying a filename supplied by the publisher.
pub const ATTR_FILENAME: &str = "filename";

const KNOWN_HINTS: &[&str] = &[HINT_THUMBNAIL_SIZES, HINT_FILENAME];

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File reference block of the envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FileRef {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, serde_json::Value>,
}

/// Job message as it travels on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobEnvelope {
    pub job_id: JobId,
    pub file: FileRef,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub hints: HashMap<String, String>,
}

impl JobEnvelope {
    /// Envelope for generating renditions of an existing content record.
    pub fn for_content(content_id: &ContentId, sizes: Option<&str>) -> Self {
        let mut attributes = HashMap::new();
        attributes.insert(
            ATTR_CONTENT_ID.to_string(),
            serde_json::Value::String(content_id.to_string()),
        );

        let mut hints = HashMap::new();
        if let Some(sizes) = sizes.filter(|s| !s.trim().is_empty()) {
            hints.insert(HINT_THUMBNAIL_SIZES.to_string(), sizes.to_string());
        }

        Self {
            job_id: JobId::new(),
            file: FileRef {
                id: content_id.to_string(),
                attributes,
            },
            hints,
        }
    }

    pub fn with_hint(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.hints.insert(key.into(), value.into());
        self
    }
}

/// Reasons an envelope cannot become a [`ThumbnailJob`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobParseError {
    #[error("Job has no source content reference")]
    MissingSource,

    #[error("Invalid source content reference: {0}")]
    InvalidSource(String),

    #[error("Unknown job hint: {0}")]
    UnknownHint(String),

    #[error("Job id is empty")]
    EmptyJobId,
}

/// A job after strict parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailJob {
    pub job_id: JobId,
    pub source: ContentId,
    /// Raw `file.id`, used as a last-resort filename source
    pub source_path: String,
    /// Size names requested by hint; empty means the full catalogue
    pub requested_sizes: Vec<String>,
    /// Raw `thumbnail_sizes` hint, if present
    pub sizes_hint: Option<String>,
    pub filename_override: Option<String>,
    pub attribute_filename: Option<String>,
}

impl ThumbnailJob {
    /// Parse an envelope, failing closed on anything unrecognised.
    pub fn from_envelope(envelope: &JobEnvelope) -> Result<Self, JobParseError> {
        if envelope.job_id.as_str().trim().is_empty() {
            return Err(JobParseError::EmptyJobId);
        }

        let mut unknown: Vec<&str> = envelope
            .hints
            .keys()
            .map(String::as_str)
            .filter(|k| !KNOWN_HINTS.contains(k))
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(JobParseError::UnknownHint(unknown.join(",")));
        }

        let raw_source = match envelope.file.attributes.get(ATTR_CONTENT_ID) {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.as_str(),
            Some(serde_json::Value::String(_)) | Some(serde_json::Value::Null) | None => {
                envelope.file.id.as_str()
            }
            Some(other) => return Err(JobParseError::InvalidSource(other.to_string())),
        };
        if raw_source.trim().is_empty() {
            return Err(JobParseError::MissingSource);
        }
        let source = ContentId::parse(raw_source)
            .ok_or_else(|| JobParseError::InvalidSource(raw_source.to_string()))?;

        let sizes_hint = envelope.hints.get(HINT_THUMBNAIL_SIZES).cloned();
        let requested_sizes = sizes_hint
            .as_deref()
            .map(|h| split_size_names(h).map(str::to_string).collect())
            .unwrap_or_default();

        let filename_override = envelope
            .hints
            .get(HINT_FILENAME)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let attribute_filename = envelope
            .file
            .attributes
            .get(ATTR_FILENAME)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Self {
            job_id: envelope.job_id.clone(),
            source,
            source_path: envelope.file.id.clone(),
            requested_sizes,
            sizes_hint,
            filename_override,
            attribute_filename,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: serde_json::Value) -> JobEnvelope {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_source_prefers_content_id_attribute() {
        let id = ContentId::new();
        let env = envelope(json!({
            "job_id": "job-1",
            "file": { "id": "uploads/cat.png", "attributes": { "content_id": id.as_str() } }
        }));
        let job = ThumbnailJob::from_envelope(&env).unwrap();
        assert_eq!(job.source, id);
        assert_eq!(job.source_path, "uploads/cat.png");
        assert!(job.requested_sizes.is_empty());
    }

    #[test]
    fn test_source_falls_back_to_file_id() {
        let id = ContentId::new();
        let env = envelope(json!({ "job_id": "job-2", "file": { "id": id.as_str() } }));
        assert_eq!(ThumbnailJob::from_envelope(&env).unwrap().source, id);
    }

    #[test]
    fn test_missing_and_invalid_source() {
        let env = envelope(json!({ "job_id": "job-3", "file": { "id": "" } }));
        assert_eq!(ThumbnailJob::from_envelope(&env), Err(JobParseError::MissingSource));

        let env = envelope(json!({ "job_id": "job-4", "file": { "id": "cat.png" } }));
        assert!(matches!(
            ThumbnailJob::from_envelope(&env),
            Err(JobParseError::InvalidSource(_))
        ));

        let env = envelope(json!({
            "job_id": "job-5",
            "file": { "id": "", "attributes": { "content_id": 42 } }
        }));
        assert!(matches!(
            ThumbnailJob::from_envelope(&env),
            Err(JobParseError::InvalidSource(_))
        ));
    }

    #[test]
    fn test_unknown_hint_fails_closed() {
        let id = ContentId::new();
        let env = JobEnvelope::for_content(&id, None).with_hint("quality", "high");
        assert_eq!(
            ThumbnailJob::from_envelope(&env),
            Err(JobParseError::UnknownHint("quality".into()))
        );
    }

    #[test]
    fn test_hints_parsed() {
        let id = ContentId::new();
        let mut env = JobEnvelope::for_content(&id, Some("small, large,"))
            .with_hint(HINT_FILENAME, " holiday ");
        env.file
            .attributes
            .insert(ATTR_FILENAME.into(), json!("beach.jpg"));

        let job = ThumbnailJob::from_envelope(&env).unwrap();
        assert_eq!(job.requested_sizes, vec!["small", "large"]);
        assert_eq!(job.filename_override.as_deref(), Some("holiday"));
        assert_eq!(job.attribute_filename.as_deref(), Some("beach.jpg"));
    }

    #[test]
    fn test_for_content_round_trips_over_wire() {
        let id = ContentId::new();
        let env = JobEnvelope::for_content(&id, Some("medium"));
        let wire = serde_json::to_string(&env).unwrap();
        let back: JobEnvelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.hints.get(HINT_THUMBNAIL_SIZES).map(String::as_str), Some("medium"));
    }

    #[test]
    fn test_empty_job_id_rejected() {
        let env = envelope(json!({ "job_id": " ", "file": { "id": ContentId::new().as_str() } }));
        assert_eq!(ThumbnailJob::from_envelope(&env), Err(JobParseError::EmptyJobId));
    }
}

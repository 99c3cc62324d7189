//! Error types for rendering operations.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while probing or rendering a source.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{0} not found in PATH")]
    ToolNotFound(String),

    #[error("{tool} command failed: {message}")]
    CommandFailed {
        tool: String,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error("Renderer produced no output at {0}")]
    NoOutput(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediaError {
    /// Create a command failure error.
    pub fn command_failed(
        tool: impl Into<String>,
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::CommandFailed {
            tool: tool.into(),
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Text to pattern-match when classifying, including captured stderr.
    pub fn diagnostic(&self) -> String {
        match self {
            MediaError::CommandFailed {
                message,
                stderr: Some(stderr),
                ..
            } => format!("{}: {}", message, stderr.trim()),
            other => other.to_string(),
        }
    }
}

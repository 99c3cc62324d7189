//! Renderer capability contract.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use thumb_models::SizeSpec;

use crate::error::MediaResult;
use crate::probe::FileInfo;

/// One produced rendition.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOutput {
    /// Requested bounding box
    pub spec: SizeSpec,
    /// Local file holding the rendition
    pub path: PathBuf,
    /// Actual dimensions of the produced file
    pub width: u32,
    pub height: u32,
    pub source_width: u32,
    pub source_height: u32,
    pub mime_type: &'static str,
    /// Resampling or extraction method
    pub algorithm: &'static str,
    /// Encoder quality, where the output format has one
    pub quality: Option<u8>,
}

/// Converts a source file into fitted renditions.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Short renderer name for logs.
    fn name(&self) -> &'static str;

    /// Whether this renderer handles the given (normalised) media type.
    fn supports(&self, mime_type: &str) -> bool;

    /// Produce one output per spec under `output_base`.
    ///
    /// All-or-nothing: any failure aborts the whole call.
    async fn generate(
        &self,
        source: &Path,
        output_base: &Path,
        specs: &[SizeSpec],
    ) -> MediaResult<Vec<RenderOutput>>;

    /// Inspect a source without rendering it.
    async fn probe(&self, source: &Path) -> MediaResult<FileInfo>;
}

/// Lowercase a media type and strip any parameters.
pub fn normalize_mime(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mime() {
        assert_eq!(normalize_mime(" Image/JPEG; charset=binary"), "image/jpeg");
        assert_eq!(normalize_mime(""), "");
    }
}

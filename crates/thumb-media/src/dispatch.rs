//! Renderer selection by media type.

use std::sync::Arc;
use std::time::Duration;

use crate::bitmap::ImageRenderer;
use crate::command::ToolRunner;
use crate::document::DocumentRenderer;
use crate::error::{MediaError, MediaResult};
use crate::renderer::{normalize_mime, Renderer};
use crate::video::VideoRenderer;

/// Media types the renderers are known to handle.
const SUPPORTED_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/bmp",
    "image/tiff",
    "video/mp4",
    "video/mpeg",
    "video/quicktime",
    "video/x-msvideo",
    "video/webm",
    "video/x-matroska",
    "video/x-flv",
    "application/pdf",
];

pub fn supported_mime_types() -> &'static [&'static str] {
    SUPPORTED_MIME_TYPES
}

pub fn is_supported_mime(mime_type: &str) -> bool {
    let mime = normalize_mime(mime_type);
    SUPPORTED_MIME_TYPES.contains(&mime.as_str())
}

/// Outcome of [`RendererRegistry::select`].
#[derive(Clone)]
pub struct Selection {
    pub renderer: Arc<dyn Renderer>,
    /// The declared type matched nothing and the fallback was chosen
    pub fell_back: bool,
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selection")
            .field("renderer", &self.renderer.name())
            .field("fell_back", &self.fell_back)
            .finish()
    }
}

/// Ordered set of renderers plus the fallback used for unknown types.
#[derive(Clone)]
pub struct RendererRegistry {
    renderers: Vec<Arc<dyn Renderer>>,
    fallback: Arc<dyn Renderer>,
}

impl RendererRegistry {
    pub fn new(renderers: Vec<Arc<dyn Renderer>>, fallback: Arc<dyn Renderer>) -> Self {
        Self {
            renderers,
            fallback,
        }
    }

    /// Image, video and document renderers; external tools bounded by `tool_timeout`.
    pub fn with_defaults(tool_timeout: Duration) -> Self {
        let runner = ToolRunner::new().with_timeout(tool_timeout);
        let image: Arc<dyn Renderer> = Arc::new(ImageRenderer::new());
        Self::new(
            vec![
                image.clone(),
                Arc::new(VideoRenderer::new(runner.clone())),
                Arc::new(DocumentRenderer::new(runner)),
            ],
            image,
        )
    }

    /// Strict lookup; fails for a type no renderer claims.
    pub fn find(&self, mime_type: &str) -> MediaResult<Arc<dyn Renderer>> {
        let mime = normalize_mime(mime_type);
        self.renderers
            .iter()
            .find(|r| r.supports(&mime))
            .cloned()
            .ok_or_else(|| MediaError::UnsupportedFormat(mime_type.to_string()))
    }

    /// Lookup that falls back to the bitmap renderer for unknown types.
    /// The caller must surface `fell_back`.
    pub fn select(&self, mime_type: &str) -> Selection {
        match self.find(mime_type) {
            Ok(renderer) => Selection {
                renderer,
                fell_back: false,
            },
            Err(_) => Selection {
                renderer: self.fallback.clone(),
                fell_back: true,
            },
        }
    }
}

impl std::fmt::Debug for RendererRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.renderers.iter().map(|r| r.name()).collect();
        f.debug_struct("RendererRegistry")
            .field("renderers", &names)
            .field("fallback", &self.fallback.name())
            .finish()
    }
}

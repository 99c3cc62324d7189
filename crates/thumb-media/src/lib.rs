//! Thumbnail renderers.
//!
//! This crate provides:
//! - A [`Renderer`] capability trait
//! - Bitmap (in-process), video (ffmpeg) and document (pdftoppm) renderers
//! - Fit-to-box sizing that never upscales
//! - Media-type dispatch with a bitmap fallback

pub mod bitmap;
pub mod command;
pub mod dispatch;
pub mod document;
pub mod error;
pub mod probe;
pub mod renderer;
pub mod sizing;
pub mod video;

pub use bitmap::ImageRenderer;
pub use command::{check_tool, FfmpegCommand, ToolRunner};
pub use dispatch::{is_supported_mime, supported_mime_types, RendererRegistry, Selection};
pub use document::DocumentRenderer;
pub use error::{MediaError, MediaResult};
pub use probe::FileInfo;
pub use renderer::{normalize_mime, RenderOutput, Renderer};
pub use sizing::fit_within;
pub use video::VideoRenderer;

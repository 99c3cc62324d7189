//! In-process bitmap renderer.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::debug;

use thumb_models::SizeSpec;

use crate::error::{MediaError, MediaResult};
use crate::probe::{probe_image, FileInfo};
use crate::renderer::{RenderOutput, Renderer};
use crate::sizing::{fit_within, output_path};

pub const ALGORITHM: &str = "lanczos3";

/// JPEG encoder quality for bitmap renditions.
pub const JPEG_QUALITY: u8 = 85;

/// Decodes once, then resizes to each box with Lanczos3.
#[derive(Debug, Clone, Default)]
pub struct ImageRenderer;

impl ImageRenderer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Renderer for ImageRenderer {
    fn name(&self) -> &'static str {
        "image"
    }

    fn supports(&self, mime_type: &str) -> bool {
        mime_type.starts_with("image/")
    }

    async fn generate(
        &self,
        source: &Path,
        output_base: &Path,
        specs: &[SizeSpec],
    ) -> MediaResult<Vec<RenderOutput>> {
        if !source.exists() {
            return Err(MediaError::FileNotFound(source.to_path_buf()));
        }
        let source = source.to_path_buf();
        let output_base = output_base.to_path_buf();
        let specs = specs.to_vec();

        tokio::task::spawn_blocking(move || render_all(&source, &output_base, &specs))
            .await
            .map_err(|e| MediaError::internal(format!("render task failed: {}", e)))?
    }

    async fn probe(&self, source: &Path) -> MediaResult<FileInfo> {
        probe_image(source).await
    }
}

fn render_all(source: &Path, output_base: &Path, specs: &[SizeSpec]) -> MediaResult<Vec<RenderOutput>> {
    let reader = image::io::Reader::open(source)?.with_guessed_format()?;
    let format = reader.format();
    let img = reader.decode()?;
    let (src_w, src_h) = (img.width(), img.height());

    let keep_png = matches!(format, Some(ImageFormat::Png) | Some(ImageFormat::Gif));

    specs
        .iter()
        .map(|spec| -> MediaResult<RenderOutput> {
            let (w, h) = fit_within(src_w, src_h, spec.width, spec.height);
            let resized = if (w, h) == (src_w, src_h) {
                img.clone()
            } else {
                img.resize_exact(w, h, FilterType::Lanczos3)
            };

            let (path, mime_type, quality) = if keep_png {
                let path = output_path(output_base, &spec.name, "png");
                resized.save_with_format(&path, ImageFormat::Png)?;
                (path, "image/png", None)
            } else {
                let path = output_path(output_base, &spec.name, "jpg");
                write_jpeg(&resized, &path)?;
                (path, "image/jpeg", Some(JPEG_QUALITY))
            };

            let (width, height) = image::image_dimensions(&path)?;
            debug!(
                size = %spec.name,
                "Rendered {}x{} -> {}x{}",
                src_w, src_h, width, height
            );

            Ok(RenderOutput {
                spec: spec.clone(),
                path,
                width,
                height,
                source_width: src_w,
                source_height: src_h,
                mime_type,
                algorithm: ALGORITHM,
                quality,
            })
        })
        .collect()
}

fn write_jpeg(img: &DynamicImage, path: &Path) -> MediaResult<()> {
    let rgb = img.to_rgb8();
    let mut writer = BufWriter::new(File::create(path)?);
    JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY).encode_image(&rgb)?;
    Ok(())
}

/// Shrink an existing file in place so it fits the box. Returns the new
/// dimensions.
pub(crate) fn shrink_file_to_box(path: &Path, max_w: u32, max_h: u32) -> MediaResult<(u32, u32)> {
    let img = image::open(path)?;
    let (w, h) = fit_within(img.width(), img.height(), max_w, max_h);
    if (w, h) != (img.width(), img.height()) {
        img.resize_exact(w, h, FilterType::Lanczos3).save(path)?;
    }
    Ok((w, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_png(dir: &Path, w: u32, h: u32) -> PathBuf {
        let path = dir.join("source.png");
        RgbaImage::from_pixel(w, h, Rgba([200, 10, 10, 128]))
            .save(&path)
            .unwrap();
        path
    }

    #[tokio::test]
    async fn test_fit_and_no_upscale() {
        let dir = TempDir::new().unwrap();
        let src = write_png(dir.path(), 400, 200);
        let specs = vec![SizeSpec::new("small", 100, 100), SizeSpec::new("huge", 1000, 1000)];

        let outputs = ImageRenderer::new()
            .generate(&src, &dir.path().join("source"), &specs)
            .await
            .unwrap();

        assert_eq!(outputs.len(), 2);
        assert_eq!((outputs[0].width, outputs[0].height), (100, 50));
        assert_eq!((outputs[1].width, outputs[1].height), (400, 200));
        assert_eq!(outputs[0].source_width, 400);
        assert_eq!(outputs[0].mime_type, "image/png");
        assert!(outputs[0].path.ends_with("source_small.png"));
        assert!(outputs[0].path.exists());
    }

    #[tokio::test]
    async fn test_jpeg_source_renders_jpeg() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("photo.jpg");
        RgbImage::from_pixel(300, 600, Rgb([1, 2, 3])).save(&src).unwrap();

        let outputs = ImageRenderer::new()
            .generate(&src, &dir.path().join("photo"), &[SizeSpec::new("m", 150, 150)])
            .await
            .unwrap();

        assert_eq!((outputs[0].width, outputs[0].height), (75, 150));
        assert_eq!(outputs[0].mime_type, "image/jpeg");
        assert_eq!(outputs[0].quality, Some(JPEG_QUALITY));
    }

    #[tokio::test]
    async fn test_corrupt_source_fails() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("broken.png");
        std::fs::write(&src, b"not an image").unwrap();

        let err = ImageRenderer::new()
            .generate(&src, &dir.path().join("broken"), &[SizeSpec::new("s", 10, 10)])
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Image(_)));
    }

    #[test]
    fn test_shrink_file_to_box() {
        let dir = TempDir::new().unwrap();
        let src = write_png(dir.path(), 400, 200);
        assert_eq!(shrink_file_to_box(&src, 100, 300).unwrap(), (100, 50));
        assert_eq!(image::image_dimensions(&src).unwrap(), (100, 50));
    }
}

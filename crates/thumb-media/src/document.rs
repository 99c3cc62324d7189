//! Document renderer: rasterises the first PDF page with pdftoppm.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use thumb_models::SizeSpec;

use crate::bitmap::shrink_file_to_box;
use crate::command::ToolRunner;
use crate::error::{MediaError, MediaResult};
use crate::probe::{output_dimensions, pdf_page_points, probe_document, FileInfo};
use crate::renderer::{RenderOutput, Renderer};

pub const ALGORITHM: &str = "pdftoppm";

/// Rasterisation resolution; also caps the output size (no upscaling).
pub const DEFAULT_DPI: u32 = 150;

#[derive(Debug, Clone)]
pub struct DocumentRenderer {
    runner: ToolRunner,
    dpi: u32,
}

impl Default for DocumentRenderer {
    fn default() -> Self {
        Self::new(ToolRunner::new())
    }
}

impl DocumentRenderer {
    pub fn new(runner: ToolRunner) -> Self {
        Self {
            runner,
            dpi: DEFAULT_DPI,
        }
    }

    /// Native first-page size in pixels at the render DPI.
    async fn native_size(&self, source: &Path) -> MediaResult<(u32, u32)> {
        let output = self
            .runner
            .run("pdfinfo", &[source.to_string_lossy().to_string()])
            .await?;
        let (w_pts, h_pts) = pdf_page_points(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| MediaError::InvalidSource("pdfinfo reported no page size".to_string()))?;
        let scale = self.dpi as f64 / 72.0;
        Ok(((w_pts * scale).round() as u32, (h_pts * scale).round() as u32))
    }

    /// pdftoppm arguments for one page render. Output lands at `<out_base>.png`.
    pub fn page_args(&self, source: &Path, out_base: &Path, scale_to: Option<u32>) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(px) = scale_to {
            args.push("-scale-to".to_string());
            args.push(px.to_string());
        }
        args.extend(
            ["-png", "-singlefile", "-f", "1", "-l", "1", "-r"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.push(self.dpi.to_string());
        args.push(source.to_string_lossy().to_string());
        args.push(out_base.to_string_lossy().to_string());
        args
    }
}

#[async_trait]
impl Renderer for DocumentRenderer {
    fn name(&self) -> &'static str {
        "document"
    }

    fn supports(&self, mime_type: &str) -> bool {
        mime_type == "application/pdf"
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
        let (native_w, native_h) = self.native_size(source).await?;
        let native_long = native_w.max(native_h);
        let mut outputs = Vec::with_capacity(specs.len());

        for spec in specs {
            let stem = format!(
                "{}_{}",
                output_base
                    .file_name()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "thumbnail".to_string()),
                spec.name
            );
            let out_base = output_base.with_file_name(&stem);
            let long_side = spec.width.max(spec.height);
            let scale_to = (native_long == 0 || long_side < native_long).then_some(long_side);

            self.runner
                .run("pdftoppm", &self.page_args(source, &out_base, scale_to))
                .await?;

            let path: PathBuf = out_base.with_file_name(format!("{}.png", stem));
            if !path.exists() {
                return Err(MediaError::NoOutput(path));
            }

            // -scale-to bounds the long side only; enforce the full box.
            let (max_w, max_h) = (spec.width, spec.height);
            let shrink_target = path.clone();
            tokio::task::spawn_blocking(move || shrink_file_to_box(&shrink_target, max_w, max_h))
                .await
                .map_err(|e| MediaError::internal(format!("resize task failed: {}", e)))??;

            let (width, height) = output_dimensions(&path).await?;
            debug!(size = %spec.name, "Rasterised page {}x{}", width, height);

            outputs.push(RenderOutput {
                spec: spec.clone(),
                path,
                width,
                height,
                source_width: native_w,
                source_height: native_h,
                mime_type: "image/png",
                algorithm: ALGORITHM,
                quality: None,
            });
        }

        Ok(outputs)
    }

    async fn probe(&self, source: &Path) -> MediaResult<FileInfo> {
        probe_document(&self.runner, source).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_args() {
        let renderer = DocumentRenderer::default();
        let args = renderer.page_args(Path::new("doc.pdf"), Path::new("/tmp/doc_small"), Some(150));
        assert_eq!(
            args.join(" "),
            "-scale-to 150 -png -singlefile -f 1 -l 1 -r 150 doc.pdf /tmp/doc_small"
        );

        let args = renderer.page_args(Path::new("doc.pdf"), Path::new("/tmp/doc_large"), None);
        assert!(!args.contains(&"-scale-to".to_string()));
    }

    #[test]
    fn test_supports() {
        let renderer = DocumentRenderer::default();
        assert!(renderer.supports("application/pdf"));
        assert!(!renderer.supports("application/zip"));
    }
}

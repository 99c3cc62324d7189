//! Video renderer: extracts a representative frame with ffmpeg.

use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

use thumb_models::SizeSpec;

use crate::command::{FfmpegCommand, ToolRunner};
use crate::error::{MediaError, MediaResult};
use crate::probe::{output_dimensions, probe_video, FileInfo};
use crate::renderer::{RenderOutput, Renderer};
use crate::sizing::{fit_within, output_path};

pub const ALGORITHM: &str = "ffmpeg-thumbnail";

/// Seconds skipped at the start to avoid intro frames.
pub const DEFAULT_SEEK_SECS: f64 = 5.0;

/// ffmpeg `-q:v` for JPEG output (2 = high quality).
const JPEG_QSCALE: &str = "2";

/// Frame-extraction renderer backed by ffmpeg and ffprobe.
#[derive(Debug, Clone)]
pub struct VideoRenderer {
    runner: ToolRunner,
    seek_secs: f64,
}

impl Default for VideoRenderer {
    fn default() -> Self {
        Self::new(ToolRunner::new())
    }
}

impl VideoRenderer {
    pub fn new(runner: ToolRunner) -> Self {
        Self {
            runner,
            seek_secs: DEFAULT_SEEK_SECS,
        }
    }

    pub fn with_seek(mut self, seconds: f64) -> Self {
        self.seek_secs = seconds.max(0.0);
        self
    }

    /// Build the extraction command for one box.
    pub fn frame_command(
        &self,
        source: &Path,
        output: &Path,
        seek: f64,
        width: u32,
        height: u32,
    ) -> FfmpegCommand {
        FfmpegCommand::new(source, output)
            .seek(seek)
            .video_filter(format!(
                "thumbnail,scale={}:{}:force_original_aspect_ratio=decrease",
                width, height
            ))
            .single_frame()
            .output_arg("-pix_fmt")
            .output_arg("yuvj420p")
            .output_arg("-q:v")
            .output_arg(JPEG_QSCALE)
    }

    async fn extract(&self, source: &Path, output: &Path, width: u32, height: u32) -> MediaResult<()> {
        let cmd = self.frame_command(source, output, self.seek_secs, width, height);
        let first = self.runner.run_ffmpeg(&cmd).await;

        if self.seek_secs > 0.0 && (first.is_err() || !has_content(output).await) {
            // Shorter than the seek offset; retry from the first frame.
            info!(
                "No frame after {}s seek in {}, retrying from start",
                self.seek_secs,
                source.display()
            );
            let cmd = self.frame_command(source, output, 0.0, width, height);
            self.runner.run_ffmpeg(&cmd).await?;
        } else {
            first?;
        }

        if has_content(output).await {
            Ok(())
        } else {
            Err(MediaError::NoOutput(output.to_path_buf()))
        }
    }
}

async fn has_content(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len() > 0)
        .unwrap_or(false)
}

#[async_trait]
impl Renderer for VideoRenderer {
    fn name(&self) -> &'static str {
        "video"
    }

    fn supports(&self, mime_type: &str) -> bool {
        mime_type.starts_with("video/")
    }

    async fn generate(
        &self,
        source: &Path,
        output_base: &Path,
        specs: &[SizeSpec],
    ) -> MediaResult<Vec<RenderOutput>> {
        let info = probe_video(&self.runner, source).await?;
        let mut outputs = Vec::with_capacity(specs.len());

        for spec in specs {
            let (w, h) = fit_within(info.width, info.height, spec.width, spec.height);
            let path = output_path(output_base, &spec.name, "jpg");
            self.extract(source, &path, w, h).await?;

            let (width, height) = output_dimensions(&path).await?;
            debug!(size = %spec.name, "Extracted frame {}x{}", width, height);

            outputs.push(RenderOutput {
                spec: spec.clone(),
                path,
                width,
                height,
                source_width: info.width,
                source_height: info.height,
                mime_type: "image/jpeg",
                algorithm: ALGORITHM,
                quality: None,
            });
        }

        Ok(outputs)
    }

    async fn probe(&self, source: &Path) -> MediaResult<FileInfo> {
        probe_video(&self.runner, source).await
    }
}

//! Source inspection: ffprobe for video, pdfinfo for documents, header
//! decoding for bitmaps.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::command::ToolRunner;
use crate::error::{MediaError, MediaResult};

/// Points per inch in PDF page geometry.
const PDF_POINTS_PER_INCH: f64 = 72.0;

/// Screen DPI used when reporting document page size in pixels.
const REPORT_DPI: f64 = 96.0;

/// Basic facts about a source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Duration in seconds (video)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Page count (documents)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<u32>,
    /// File size in bytes
    pub size_bytes: u64,
    /// Detected format name
    pub format: String,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
}

fn ensure_exists(path: &Path) -> MediaResult<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(MediaError::FileNotFound(path.to_path_buf()))
    }
}

/// Probe a video file with ffprobe.
pub async fn probe_video(runner: &ToolRunner, path: &Path) -> MediaResult<FileInfo> {
    ensure_exists(path)?;

    let args = vec![
        "-v".to_string(),
        "quiet".to_string(),
        "-print_format".to_string(),
        "json".to_string(),
        "-show_format".to_string(),
        "-show_streams".to_string(),
        path.to_string_lossy().to_string(),
    ];
    let output = runner.run("ffprobe", &args).await?;
    parse_ffprobe(&output.stdout)
}

fn parse_ffprobe(stdout: &[u8]) -> MediaResult<FileInfo> {
    let probe: FfprobeOutput = serde_json::from_slice(stdout)?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .ok_or_else(|| MediaError::InvalidSource("No video stream found".to_string()))?;

    Ok(FileInfo {
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        duration: probe.format.duration.as_deref().and_then(|d| d.parse().ok()),
        pages: None,
        size_bytes: probe
            .format
            .size
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        format: probe.format.format_name.unwrap_or_else(|| "video".to_string()),
    })
}

/// Probe a PDF with pdfinfo. Dimensions are the first page at 96 DPI.
pub async fn probe_document(runner: &ToolRunner, path: &Path) -> MediaResult<FileInfo> {
    ensure_exists(path)?;
    let output = runner
        .run("pdfinfo", &[path.to_string_lossy().to_string()])
        .await?;
    let mut info = parse_pdfinfo(&String::from_utf8_lossy(&output.stdout))?;
    if info.size_bytes == 0 {
        info.size_bytes = tokio::fs::metadata(path).await?.len();
    }
    Ok(info)
}

/// Page size in PDF points from pdfinfo output, if present.
pub(crate) fn pdf_page_points(stdout: &str) -> Option<(f64, f64)> {
    stdout.lines().find_map(|line| {
        let rest = line.strip_prefix("Page size:")?;
        let mut parts = rest.split_whitespace();
        let w: f64 = parts.next()?.parse().ok()?;
        if parts.next()? != "x" {
            return None;
        }
        let h: f64 = parts.next()?.parse().ok()?;
        Some((w, h))
    })
}

fn parse_pdfinfo(stdout: &str) -> MediaResult<FileInfo> {
    let field = |name: &str| {
        stdout.lines().find_map(|line| {
            line.strip_prefix(name)
                .and_then(|rest| rest.strip_prefix(':'))
                .map(str::trim)
        })
    };

    let pages: u32 = field("Pages")
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| MediaError::InvalidSource("pdfinfo reported no pages".to_string()))?;

    let (width, height) = pdf_page_points(stdout)
        .map(|(w, h)| {
            (
                (w * REPORT_DPI / PDF_POINTS_PER_INCH).round() as u32,
                (h * REPORT_DPI / PDF_POINTS_PER_INCH).round() as u32,
            )
        })
        .unwrap_or((0, 0));

    let size_bytes = field("File size")
        .and_then(|s| s.split_whitespace().next())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    Ok(FileInfo {
        width,
        height,
        duration: None,
        pages: Some(pages),
        size_bytes,
        format: "pdf".to_string(),
    })
}

/// Probe a bitmap by reading its header.
pub async fn probe_image(path: &Path) -> MediaResult<FileInfo> {
    ensure_exists(path)?;
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> MediaResult<FileInfo> {
        let reader = image::io::Reader::open(&owned)?.with_guessed_format()?;
        let format = reader
            .format()
            .map(|f| format!("{:?}", f).to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());
        let (width, height) = reader.into_dimensions()?;
        Ok(FileInfo {
            width,
            height,
            duration: None,
            pages: None,
            size_bytes: std::fs::metadata(&owned)?.len(),
            format,
        })
    })
    .await
    .map_err(|e| MediaError::internal(format!("probe task failed: {}", e)))?
}

/// Dimensions of a produced file, read back from its header.
pub async fn output_dimensions(path: &Path) -> MediaResult<(u32, u32)> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || image::image_dimensions(&owned))
        .await
        .map_err(|e| MediaError::internal(format!("dimension task failed: {}", e)))?
        .map_err(MediaError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ffprobe() {
        let json = br#"{
            "streams": [
                {"codec_type": "audio"},
                {"codec_type": "video", "width": 1920, "height": 1080}
            ],
            "format": {"format_name": "mov,mp4", "duration": "12.5", "size": "4096"}
        }"#;
        let info = parse_ffprobe(json).unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
        assert_eq!(info.duration, Some(12.5));
        assert_eq!(info.size_bytes, 4096);
    }

    #[test]
    fn test_parse_ffprobe_without_video() {
        let json = br#"{"streams": [{"codec_type": "audio"}], "format": {}}"#;
        assert!(matches!(parse_ffprobe(json), Err(MediaError::InvalidSource(_))));
    }

    #[test]
    fn test_parse_pdfinfo() {
        let out = "Title:          report\n\
                   Pages:          3\n\
                   Page size:      612 x 792 pts (letter)\n\
                   File size:      34567 bytes\n";
        let info = parse_pdfinfo(out).unwrap();
        assert_eq!(info.pages, Some(3));
        assert_eq!((info.width, info.height), (816, 1056));
        assert_eq!(info.size_bytes, 34567);
        assert_eq!(pdf_page_points(out), Some((612.0, 792.0)));
    }

    #[test]
    fn test_parse_pdfinfo_requires_pages() {
        assert!(parse_pdfinfo("Title: x\n").is_err());
    }

    #[tokio::test]
    async fn test_probe_image_missing_file() {
        let err = probe_image(Path::new("/nonexistent/x.png")).await.unwrap_err();
        assert!(matches!(err, MediaError::FileNotFound(_)));
    }
}

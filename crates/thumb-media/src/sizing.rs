//! Fit-to-box geometry shared by every renderer.

use std::path::{Path, PathBuf};

/// Fit `(src_w, src_h)` into a `max_w x max_h` box, preserving aspect ratio.
///
/// Never upscales: a source that already fits is returned unchanged.
/// Dimensions are at least 1.
pub fn fit_within(src_w: u32, src_h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if src_w == 0 || src_h == 0 {
        return (max_w.max(1), max_h.max(1));
    }
    if src_w <= max_w && src_h <= max_h {
        return (src_w, src_h);
    }

    let src_aspect = src_w as f64 / src_h as f64;
    let box_aspect = max_w as f64 / max_h as f64;

    let (w, h) = if src_aspect > box_aspect {
        let w = max_w;
        let h = (w as f64 / src_aspect).round() as u32;
        (w, h)
    } else {
        let h = max_h;
        let w = (h as f64 * src_aspect).round() as u32;
        (w, h)
    };

    (w.clamp(1, max_w), h.clamp(1, max_h))
}

/// `<base>_<size>.<ext>` next to the output base.
pub fn output_path(base: &Path, size_name: &str, ext: &str) -> PathBuf {
    let stem = base
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "thumbnail".to_string());
    base.with_file_name(format!("{}_{}.{}", stem, size_name, ext))
}

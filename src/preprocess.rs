use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage, GenericImageView};

/// Longest side an image may have before it is handed to an embedder.
/// Stored embeddings are only comparable when every run uses the same value.
pub const MAX_DIMENSION: u32 = 1600;

pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|s| ext.eq_ignore_ascii_case(s))
        })
        .unwrap_or(false)
}

/// Supported image files directly under `dir`, sorted by file name.
pub fn scan_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("reading directory {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() || !is_supported(&path) {
            continue;
        }
        // store keys are exact file names
        if entry.file_name().to_str().is_none() {
            log::warn!("[SKIP] {}: file name is not valid UTF-8", path.display());
            continue;
        }
        files.push(path);
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Target size for an image whose longest side exceeds `max_dim`, or `None`
/// when it already fits.
pub fn scaled_size(width: u32, height: u32, max_dim: u32) -> Option<(u32, u32)> {
    let longest = width.max(height);
    if longest <= max_dim {
        return None;
    }
    let scale = max_dim as f64 / longest as f64;
    let shorter = |side: u32| ((side as f64 * scale) as u32).clamp(1, max_dim);
    // long side is always exactly max_dim
    if width >= height {
        Some((max_dim, shorter(height)))
    } else {
        Some((shorter(width), max_dim))
    }
}

pub fn downscale(img: DynamicImage, max_dim: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    match scaled_size(width, height, max_dim) {
        Some((w, h)) => img.resize_exact(w, h, FilterType::Triangle),
        None => img,
    }
}

/// Decode an image (format sniffed from content) and apply the size cap.
pub fn load_image(path: &Path, max_dim: u32) -> Result<DynamicImage> {
    let img = image::ImageReader::open(path)
        .with_context(|| format!("opening {}", path.display()))?
        .with_guessed_format()?
        .decode()
        .with_context(|| format!("decoding {}", path.display()))?;
    Ok(downscale(DynamicImage::ImageRgb8(img.to_rgb8()), max_dim))
}

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use faceseek::Embedder;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};

/// Pixel colour that makes [`FakeEmbedder`] panic.
pub const PANIC_COLOR: [u8; 3] = [255, 255, 255];

/// Deterministic stand-in for the ONNX pipeline.
///
/// The colour of pixel (0, 0) decides the result: `g / 10` faces, face `k`
/// embedded as `[r + 1, b + 1, k]`, at most `max_faces` of them.
#[derive(Clone, Default)]
pub struct FakeEmbedder {
    pub seen: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl Embedder for FakeEmbedder {
    fn detect_and_embed(
        &mut self,
        image: &DynamicImage,
        max_faces: usize,
    ) -> Result<Vec<Vec<f32>>> {
        self.seen
            .lock()
            .unwrap()
            .push((image.width(), image.height()));

        let [r, g, b, _] = image.get_pixel(0, 0).0;
        if [r, g, b] == PANIC_COLOR {
            panic!("fake embedder tripped");
        }
        Ok((0..g / 10)
            .take(max_faces)
            .map(|k| vec![r as f32 + 1.0, b as f32 + 1.0, k as f32])
            .collect())
    }
}

/// Solid image saved as PNG data under `name`, whatever its extension.
pub fn write_image(dir: &Path, name: &str, width: u32, height: u32, rgb: [u8; 3]) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    RgbImage::from_pixel(width, height, Rgb(rgb))
        .save_with_format(&path, ImageFormat::Png)
        .unwrap();
    path
}

/// Image with `faces` faces for [`FakeEmbedder`].
pub fn write_faces(dir: &Path, name: &str, faces: u8, tag: u8) -> PathBuf {
    write_image(dir, name, 8, 8, [tag, faces * 10, 0])
}

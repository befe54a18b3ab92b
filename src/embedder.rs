use std::path::PathBuf;

use anyhow::{Context, Result};
use faceseek_vision::{DetectOptions, Embedding, Pipeline};
use image::DynamicImage;

use crate::config::Config;

/// Face detection + embedding capability.
///
/// Instances are not shared between threads: every extraction worker builds
/// its own through a factory closure. Output order is the implementation's
/// native face order and must be deterministic for a given image.
pub trait Embedder {
    fn detect_and_embed(&mut self, image: &DynamicImage, max_faces: usize)
        -> Result<Vec<Vec<f32>>>;
}

impl<E: Embedder + ?Sized> Embedder for Box<E> {
    fn detect_and_embed(
        &mut self,
        image: &DynamicImage,
        max_faces: usize,
    ) -> Result<Vec<Vec<f32>>> {
        (**self).detect_and_embed(image, max_faces)
    }
}

impl Embedder for Pipeline {
    fn detect_and_embed(
        &mut self,
        image: &DynamicImage,
        max_faces: usize,
    ) -> Result<Vec<Vec<f32>>> {
        Ok(self
            .embed_faces(image, max_faces)?
            .iter()
            .map(Embedding::to_vec)
            .collect())
    }
}

/// Builds ONNX pipelines from the model paths in `cfg`.
#[derive(Debug, Clone)]
pub struct OnnxFactory {
    detector: PathBuf,
    recognizer: PathBuf,
    options: DetectOptions,
}

impl OnnxFactory {
    pub fn new(cfg: &Config) -> Self {
        Self {
            detector: cfg.detector_model.clone(),
            recognizer: cfg.recognizer_model.clone(),
            options: cfg.detect_options(),
        }
    }

    pub fn build(&self) -> Result<Pipeline> {
        Pipeline::from_files(&self.detector, &self.recognizer, self.options)
            .context("Failed to initialize face recognition pipeline")
    }
}

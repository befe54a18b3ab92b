use std::path::Path;

use anyhow::{Context, Result};
use image::DynamicImage;
use ort::session::Session;

use crate::face::{self, Detection, Embedding, FACE_SIZE};

/// Detector tuning shared by every image a pipeline processes.
#[derive(Debug, Clone, Copy)]
pub struct DetectOptions {
    pub score_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            score_threshold: 0.6,
            nms_threshold: 0.3,
        }
    }
}

/// Full pipeline: detect faces → align → encode
pub struct Pipeline {
    pub detector: Session,
    pub encoder: Session,
    pub options: DetectOptions,
}

impl Pipeline {
    pub fn from_files(detector: &Path, recognizer: &Path, options: DetectOptions) -> Result<Self> {
        Ok(Self {
            detector: crate::model::detector_session(detector)?,
            encoder: crate::model::recog_session(recognizer)?,
            options,
        })
    }

    /// Detected faces, most confident first.
    pub fn detect(&mut self, img: &DynamicImage) -> Result<Vec<Detection>> {
        face::detect_faces(
            &mut self.detector,
            img,
            self.options.score_threshold,
            self.options.nms_threshold,
        )
        .context("detecting faces")
    }

    /// Embed up to `max_faces` faces in detector order. An image without a
    /// detectable face yields an empty list.
    pub fn embed_faces(&mut self, img: &DynamicImage, max_faces: usize) -> Result<Vec<Embedding>> {
        let detections = self.detect(img)?;
        log::debug!(
            "detected {} face(s), embedding at most {}",
            detections.len(),
            max_faces
        );

        detections
            .iter()
            .take(max_faces)
            .enumerate()
            .map(|(idx, detection)| {
                let aligned = face::align_face(img, detection, FACE_SIZE)
                    .with_context(|| format!("aligning face {}", idx))?;
                face::encode_face(&mut self.encoder, &aligned)
                    .with_context(|| format!("encoding face {}", idx))
            })
            .collect()
    }
}

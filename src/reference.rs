use std::path::Path;

use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::embedder::Embedder;
use crate::error::Error;
use crate::extract::image_id;
use crate::preprocess;

/// How reference faces are turned into identities.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum ReferenceMode {
    /// One identity: the element-wise mean of every reference face
    #[default]
    Mean,
    /// One identity per reference face, in file then face order
    PerFace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceVector {
    pub identity_index: usize,
    pub vector: Vec<f32>,
}

fn usable(vector: &[f32]) -> bool {
    !vector.is_empty()
        && vector.iter().all(|x| x.is_finite())
        && vector.iter().any(|&x| x != 0.0)
}

/// Every usable face vector found in the reference directory, in file order.
/// Images that cannot be read or embedded are skipped with a warning.
pub fn collect_faces<E: Embedder + ?Sized>(
    dir: &Path,
    embedder: &mut E,
    max_faces: usize,
    max_dimension: u32,
) -> Result<Vec<Vec<f32>>> {
    if !dir.is_dir() {
        return Err(Error::NoReferenceFace {
            dir: dir.to_path_buf(),
        }
        .into());
    }

    let mut faces = Vec::new();
    for path in preprocess::scan_images(dir)? {
        let name = image_id(&path);
        let found = preprocess::load_image(&path, max_dimension)
            .and_then(|img| embedder.detect_and_embed(&img, max_faces));
        let found = match found {
            Ok(found) => found,
            Err(err) => {
                warn!("[SKIP] reference {}: {:#}", name, err);
                continue;
            }
        };

        let before = faces.len();
        for vector in found.into_iter().take(max_faces) {
            if usable(&vector) {
                faces.push(vector);
            } else {
                warn!("[SKIP] reference {}: degenerate face vector", name);
            }
        }
        info!("Detected {} face(s) in reference {}", faces.len() - before, name);
    }

    if faces.is_empty() {
        return Err(Error::NoReferenceFace {
            dir: dir.to_path_buf(),
        }
        .into());
    }
    Ok(faces)
}

/// Element-wise mean, accumulated in f64.
pub fn mean_vector(faces: &[Vec<f32>]) -> Result<Vec<f32>> {
    let Some(first) = faces.first() else {
        return Err(Error::MalformedEmbedding {
            image_id: "reference".to_string(),
            reason: "no vectors to average".to_string(),
        }
        .into());
    };

    let dim = first.len();
    let mut sum = vec![0.0f64; dim];
    for (idx, face) in faces.iter().enumerate() {
        if face.len() != dim {
            return Err(Error::MalformedEmbedding {
                image_id: "reference".to_string(),
                reason: format!("face {} has dimension {}, expected {}", idx, face.len(), dim),
            }
            .into());
        }
        for (acc, &x) in sum.iter_mut().zip(face) {
            *acc += x as f64;
        }
    }

    let n = faces.len() as f64;
    Ok(sum.into_iter().map(|s| (s / n) as f32).collect())
}

/// Reference identities for the images in `dir`.
pub fn build_references<E: Embedder + ?Sized>(
    dir: &Path,
    embedder: &mut E,
    max_faces: usize,
    max_dimension: u32,
    mode: ReferenceMode,
) -> Result<Vec<ReferenceVector>> {
    let faces = collect_faces(dir, embedder, max_faces, max_dimension)?;

    let references = match mode {
        ReferenceMode::Mean => vec![ReferenceVector {
            identity_index: 0,
            vector: mean_vector(&faces)?,
        }],
        ReferenceMode::PerFace => faces
            .into_iter()
            .enumerate()
            .map(|(identity_index, vector)| ReferenceVector {
                identity_index,
                vector,
            })
            .collect(),
    };

    info!("Built {} reference vector(s)", references.len());
    Ok(references)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_vector() {
        let mean = mean_vector(&[vec![1.0, 2.0], vec![3.0, -2.0], vec![2.0, 3.0]]).unwrap();
        assert_eq!(mean, vec![2.0, 1.0]);

        let single = mean_vector(&[vec![0.25, 0.5]]).unwrap();
        assert_eq!(single, vec![0.25, 0.5]);
    }

    #[test]
    fn test_mean_rejects_mixed_dimensions() {
        let err = mean_vector(&[vec![1.0, 2.0], vec![1.0]]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::MalformedEmbedding { .. })
        ));
        assert!(mean_vector(&[]).is_err());
    }

    #[test]
    fn test_usable() {
        assert!(usable(&[0.0, 1.0]));
        assert!(!usable(&[0.0, 0.0]));
        assert!(!usable(&[]));
        assert!(!usable(&[f32::NAN, 1.0]));
    }
}

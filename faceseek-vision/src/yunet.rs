//! YuNet detector post-processing.
//!
//! The 2023mar export emits twelve tensors: four heads (cls, obj, bbox, kps)
//! for each of the three strides 8, 16 and 32, grouped by head:
//! `cls_8, cls_16, cls_32, obj_8, ..., kps_32`. Every tensor is `[1, H*W, C]`
//! where `H = W = input_size / stride` and C is 1, 1, 4 and 10 respectively.
//!
//! Decoding is anchor-free, one prediction per grid cell:
//! cx = (col + dx) * stride, cy = (row + dy) * stride,
//! w = exp(dw) * stride, h = exp(dh) * stride.
//! Landmarks use the same offset scheme as the box centre.

use anyhow::{Context, Result};
use ndarray::Array2;

pub const STRIDES: [usize; 3] = [8, 16, 32];

#[derive(Debug, Clone)]
pub struct RawDetection {
    pub bbox: [f32; 4], // x, y, w, h (normalized [0,1])
    pub score: f32,
    pub landmarks: [f32; 10], // 5 points: x1,y1,...,x5,y5 (normalized [0,1])
}

/// Head outputs for a single stride, reshaped to `[H*W, C]`.
#[derive(Debug, Clone)]
pub struct StrideOutputs {
    pub stride: usize,
    pub cls: Array2<f32>,
    pub obj: Array2<f32>,
    pub bbox: Array2<f32>,
    pub kps: Array2<f32>,
}

/// Combined face confidence, as computed by the reference YuNet decoder.
pub fn face_score(cls: f32, obj: f32) -> f32 {
    (cls.clamp(0.0, 1.0) * obj.clamp(0.0, 1.0)).sqrt()
}

fn take_tensor(
    outputs: &[(&[i64], &[f32])],
    index: usize,
    rows: usize,
    cols: usize,
    head: &str,
) -> Result<Array2<f32>> {
    let (shape, data) = outputs
        .get(index)
        .with_context(|| format!("missing {} output at index {}", head, index))?;

    if shape.len() != 3 || shape[0] != 1 || shape[1] as usize != rows || shape[2] as usize != cols
    {
        anyhow::bail!(
            "unexpected {} shape at index {}: {:?}, expected [1, {}, {}]",
            head,
            index,
            shape,
            rows,
            cols
        );
    }

    Ok(Array2::from_shape_vec((rows, cols), data.to_vec())?)
}

/// Split the raw output list into per-stride groups, validating every shape.
pub fn parse_yunet_outputs(
    outputs: &[(&[i64], &[f32])],
    input_size: usize,
) -> Result<Vec<StrideOutputs>> {
    let levels = STRIDES.len();
    if outputs.len() < levels * 4 {
        anyhow::bail!(
            "expected {} YuNet outputs, got {}",
            levels * 4,
            outputs.len()
        );
    }

    STRIDES
        .iter()
        .enumerate()
        .map(|(level, &stride)| {
            let side = input_size / stride;
            let cells = side * side;
            Ok(StrideOutputs {
                stride,
                cls: take_tensor(outputs, level, cells, 1, "cls")?,
                obj: take_tensor(outputs, level + levels, cells, 1, "obj")?,
                bbox: take_tensor(outputs, level + 2 * levels, cells, 4, "bbox")?,
                kps: take_tensor(outputs, level + 3 * levels, cells, 10, "kps")?,
            })
        })
        .collect()
}

/// Decode every grid cell scoring at least `score_threshold` into a detection
/// normalized to the square `input_size` canvas.
pub fn decode_detections(
    levels: &[StrideOutputs],
    score_threshold: f32,
    input_size: usize,
) -> Result<Vec<RawDetection>> {
    let size = input_size as f32;
    let mut detections = Vec::new();

    for level in levels {
        let side = input_size / level.stride;
        if level.cls.nrows() != side * side {
            anyhow::bail!(
                "expected {} cells for stride {}, got {}",
                side * side,
                level.stride,
                level.cls.nrows()
            );
        }
        let stride = level.stride as f32;

        for row in 0..side {
            for col in 0..side {
                let idx = row * side + col;
                let score = face_score(level.cls[[idx, 0]], level.obj[[idx, 0]]);
                if score < score_threshold {
                    continue;
                }

                let cx = (col as f32 + level.bbox[[idx, 0]]) * stride;
                let cy = (row as f32 + level.bbox[[idx, 1]]) * stride;
                let w = level.bbox[[idx, 2]].exp() * stride;
                let h = level.bbox[[idx, 3]].exp() * stride;

                let mut landmarks = [0.0f32; 10];
                for k in 0..5 {
                    landmarks[k * 2] = (col as f32 + level.kps[[idx, k * 2]]) * stride / size;
                    landmarks[k * 2 + 1] =
                        (row as f32 + level.kps[[idx, k * 2 + 1]]) * stride / size;
                }

                detections.push(RawDetection {
                    bbox: [
                        (cx - w / 2.0) / size,
                        (cy - h / 2.0) / size,
                        w / size,
                        h / size,
                    ],
                    score,
                    landmarks,
                });
            }
        }
    }

    Ok(detections)
}

use crate::yunet;
use anyhow::Result;
use image::{DynamicImage, GenericImageView, RgbImage};
use ndarray::{Array1, Array4};
use ort::{session::Session, value::Value};

/// Side of the square canvas YuNet is run on.
pub const DETECTOR_INPUT: u32 = 640;
/// Side of the aligned crop SFace consumes.
pub const FACE_SIZE: u32 = 112;

/// Detection result from YuNet, in source image pixels
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
    pub landmarks: [f32; 10], // right eye, left eye, nose tip, mouth corners
}

/// L2-normalized face embedding (SFace output)
#[derive(Debug, Clone)]
pub struct Embedding {
    pub vector: Array1<f32>,
}

impl Embedding {
    /// Wrap a raw model output, normalizing it to unit length.
    pub fn from_raw(raw: Vec<f32>) -> Self {
        let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let vector = if norm > 0.0 {
            raw.into_iter().map(|x| x / norm).collect()
        } else {
            raw.into_iter().collect()
        };
        Self { vector }
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.vector.to_vec()
    }

    pub fn dim(&self) -> usize {
        self.vector.len()
    }
}

/// Plane order for CHW tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Convert an interleaved RGB image into a planar CHW buffer in [0, 255].
pub fn to_planar(img: &RgbImage, order: ChannelOrder) -> Vec<f32> {
    let pixel_count = (img.width() * img.height()) as usize;
    let mut data = vec![0.0f32; 3 * pixel_count];
    let (first, rest) = data.split_at_mut(pixel_count);
    let (second, third) = rest.split_at_mut(pixel_count);

    for (i, px) in img.pixels().enumerate() {
        let [r, g, b] = px.0;
        let (c0, c2) = match order {
            ChannelOrder::Rgb => (r, b),
            ChannelOrder::Bgr => (b, r),
        };
        first[i] = c0 as f32;
        second[i] = g as f32;
        third[i] = c2 as f32;
    }

    data
}

/// Placement of a source image inside the square detector canvas.
#[derive(Debug, Clone, Copy)]
pub struct Letterbox {
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
}

impl Letterbox {
    /// Map a canvas-normalized coordinate back to source pixels.
    fn unmap(&self, v: f32, offset: u32, canvas: u32) -> f32 {
        (v * canvas as f32 - offset as f32) / self.scale
    }
}

/// Resize preserving aspect ratio and pad to a centered square canvas.
pub fn letterbox(img: &DynamicImage, target: u32) -> (RgbImage, Letterbox) {
    let (width, height) = img.dimensions();
    let scale = target as f32 / width.max(height) as f32;
    let new_width = ((width as f32 * scale) as u32).clamp(1, target);
    let new_height = ((height as f32 * scale) as u32).clamp(1, target);

    let resized = img
        .resize_exact(new_width, new_height, image::imageops::FilterType::Triangle)
        .to_rgb8();

    let mut canvas = RgbImage::new(target, target);
    let offset_x = (target - new_width) / 2;
    let offset_y = (target - new_height) / 2;
    image::imageops::overlay(&mut canvas, &resized, offset_x as i64, offset_y as i64);

    (
        canvas,
        Letterbox {
            scale,
            offset_x,
            offset_y,
        },
    )
}

/// Detect faces with YuNet. Results are ordered by descending score.
pub fn detect_faces(
    session: &mut Session,
    img: &DynamicImage,
    score_threshold: f32,
    nms_threshold: f32,
) -> Result<Vec<Detection>> {
    let target = DETECTOR_INPUT;
    let (canvas, placement) = letterbox(img, target);

    // YuNet takes raw BGR values
    let input = Array4::from_shape_vec(
        (1, 3, target as usize, target as usize),
        to_planar(&canvas, ChannelOrder::Bgr),
    )?;
    let outputs = session.run(ort::inputs![Value::from_array(input)?])?;

    let mut output_data: Vec<(Vec<i64>, Vec<f32>)> = Vec::new();
    for (_name, output) in outputs.iter() {
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        output_data.push((shape.iter().copied().collect(), data.to_vec()));
    }
    let output_refs: Vec<(&[i64], &[f32])> = output_data
        .iter()
        .map(|(s, d)| (s.as_slice(), d.as_slice()))
        .collect();

    let levels = yunet::parse_yunet_outputs(&output_refs, target as usize)?;
    let raw = yunet::decode_detections(&levels, score_threshold, target as usize)?;

    let detections: Vec<Detection> = raw
        .into_iter()
        .map(|d| {
            let x = placement.unmap(d.bbox[0], placement.offset_x, target);
            let y = placement.unmap(d.bbox[1], placement.offset_y, target);
            let mut landmarks = [0.0f32; 10];
            for i in 0..5 {
                landmarks[i * 2] = placement.unmap(d.landmarks[i * 2], placement.offset_x, target);
                landmarks[i * 2 + 1] =
                    placement.unmap(d.landmarks[i * 2 + 1], placement.offset_y, target);
            }
            Detection {
                bbox: [
                    x,
                    y,
                    d.bbox[2] * target as f32 / placement.scale,
                    d.bbox[3] * target as f32 / placement.scale,
                ],
                score: d.score,
                landmarks,
            }
        })
        .collect();

    Ok(nms(&detections, nms_threshold))
}

/// Non-maximum suppression. Output is sorted by descending score; with a
/// threshold of 1.0 or more nothing is suppressed.
pub fn nms(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    let mut sorted = detections.to_vec();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    if iou_threshold >= 1.0 {
        return sorted;
    }

    let mut keep: Vec<Detection> = Vec::new();
    for det in sorted {
        if keep
            .iter()
            .all(|k| compute_iou(&k.bbox, &det.bbox) <= iou_threshold)
        {
            keep.push(det);
        }
    }
    keep
}

fn compute_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = (a[0] + a[2]).min(b[0] + b[2]);
    let y2 = (a[1] + a[3]).min(b[1] + b[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let inter = (x2 - x1) * (y2 - y1);
    inter / (a[2] * a[3] + b[2] * b[3] - inter)
}

/// Rotation + uniform scale + translation, `out = M * in + t`.
#[derive(Debug, Clone, Copy)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Transform taking the eye pair `(left, right)` onto `(ref_left, ref_right)`.
    fn from_eyes(
        left: (f32, f32),
        right: (f32, f32),
        ref_left: (f32, f32),
        ref_right: (f32, f32),
    ) -> Option<Self> {
        let (dx, dy) = (right.0 - left.0, right.1 - left.1);
        let (rdx, rdy) = (ref_right.0 - ref_left.0, ref_right.1 - ref_left.1);
        let dist = (dx * dx + dy * dy).sqrt();
        if dist <= f32::EPSILON {
            return None;
        }
        let scale = (rdx * rdx + rdy * rdy).sqrt() / dist;
        let angle = rdy.atan2(rdx) - dy.atan2(dx);

        let a = scale * angle.cos();
        let b = scale * angle.sin();
        let centre = ((left.0 + right.0) / 2.0, (left.1 + right.1) / 2.0);
        let ref_centre = ((ref_left.0 + ref_right.0) / 2.0, (ref_left.1 + ref_right.1) / 2.0);

        Some(Self {
            a,
            b,
            tx: ref_centre.0 - (a * centre.0 - b * centre.1),
            ty: ref_centre.1 - (b * centre.0 + a * centre.1),
        })
    }

    fn invert(&self, x: f32, y: f32) -> (f32, f32) {
        let (px, py) = (x - self.tx, y - self.ty);
        let det = self.a * self.a + self.b * self.b;
        ((self.a * px + self.b * py) / det, (-self.b * px + self.a * py) / det)
    }
}

fn bilinear(img: &RgbImage, x: f32, y: f32) -> Option<image::Rgb<u8>> {
    let (w, h) = img.dimensions();
    if x < 0.0 || y < 0.0 || x >= w as f32 || y >= h as f32 {
        return None;
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0).0;
    let p10 = img.get_pixel(x1, y0).0;
    let p01 = img.get_pixel(x0, y1).0;
    let p11 = img.get_pixel(x1, y1).0;

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Some(image::Rgb(out))
}

/// Align and crop a face to `size x size` using the two eye landmarks.
pub fn align_face(img: &DynamicImage, detection: &Detection, size: u32) -> Result<DynamicImage> {
    // ArcFace reference eye positions for a 112x112 crop
    let unit = size as f32 / FACE_SIZE as f32;
    let ref_left = (38.2946 * unit, 51.6963 * unit);
    let ref_right = (73.5318 * unit, 51.5014 * unit);

    // YuNet reports the subject's right eye first, which sits on the image left
    let left = (detection.landmarks[0], detection.landmarks[1]);
    let right = (detection.landmarks[2], detection.landmarks[3]);

    let transform = Similarity::from_eyes(left, right, ref_left, ref_right)
        .ok_or_else(|| anyhow::anyhow!("degenerate eye landmarks"))?;

    let source = img.to_rgb8();
    let mut output = RgbImage::new(size, size);
    for (out_x, out_y, px) in output.enumerate_pixels_mut() {
        let (in_x, in_y) = transform.invert(out_x as f32, out_y as f32);
        if let Some(sample) = bilinear(&source, in_x, in_y) {
            *px = sample;
        }
    }

    Ok(DynamicImage::ImageRgb8(output))
}

/// Encode an aligned face crop with SFace.
pub fn encode_face(session: &mut Session, face_img: &DynamicImage) -> Result<Embedding> {
    let size = FACE_SIZE;
    let face = face_img
        .resize_exact(size, size, image::imageops::FilterType::Triangle)
        .to_rgb8();

    // SFace consumes RGB planes in [0, 255]
    let input = Array4::from_shape_vec(
        (1, 3, size as usize, size as usize),
        to_planar(&face, ChannelOrder::Rgb),
    )?;
    let outputs = session.run(ort::inputs![Value::from_array(input)?])?;
    let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

    let dim = if shape.len() == 2 {
        shape[1] as usize
    } else {
        data.len()
    };
    if dim == 0 || dim > data.len() {
        anyhow::bail!("unexpected recognizer output shape {:?}", shape);
    }

    Ok(Embedding::from_raw(data[..dim].to_vec()))
}

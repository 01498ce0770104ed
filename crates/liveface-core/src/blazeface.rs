//! BlazeFace short-range detector via ONNX Runtime.
//!
//! The model takes a 128x128 RGB image normalized to `[-1, 1]` and predicts,
//! for each of 896 fixed SSD anchors, a score logit and 16 regressors: box
//! center offset and size, then six keypoints (right eye, left eye, nose,
//! mouth, right ear, left ear), all in 128-pixel input units relative to the
//! anchor center.
//!
//! Frames are letterboxed (aspect preserved, black padding) into the input,
//! and decoded candidates are mapped back to normalized frame coordinates.

use crate::detector::{DetectionModel, DetectorError, RawDetection};
use crate::frame::Frame;
use crate::geometry::{Landmarks, Point, Rect};
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

pub const INPUT_SIZE: usize = 128;
const NUM_ANCHORS: usize = 896;
const NUM_COORDS: usize = 16;
/// (stride, anchors per cell) for the short-range model's two feature maps.
const ANCHOR_LAYERS: [(usize, usize); 2] = [(8, 2), (16, 6)];
const SCORE_CLIP: f32 = 100.0;
/// Cheap pre-filter inside the backend; the detector applies the real threshold.
const DEFAULT_MIN_CANDIDATE_SCORE: f32 = 0.5;

/// SSD anchor centers in normalized input coordinates, in model output order.
pub fn generate_anchors() -> Vec<Point> {
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);
    for (stride, per_cell) in ANCHOR_LAYERS {
        let grid = INPUT_SIZE / stride;
        for y in 0..grid {
            for x in 0..grid {
                let center = Point::new(
                    (x as f32 + 0.5) / grid as f32,
                    (y as f32 + 0.5) / grid as f32,
                );
                anchors.extend(std::iter::repeat(center).take(per_cell));
            }
        }
    }
    anchors
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Mapping between the square model input and the original frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    frame_width: f32,
    frame_height: f32,
    scale: f32,
    offset_x: f32,
    offset_y: f32,
    scaled_width: u32,
    scaled_height: u32,
}

impl Letterbox {
    pub fn new(frame_width: u32, frame_height: u32) -> Self {
        let max_dim = frame_width.max(frame_height).max(1) as f32;
        let scale = INPUT_SIZE as f32 / max_dim;
        let scaled_width = ((frame_width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE as u32);
        let scaled_height =
            ((frame_height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE as u32);
        Self {
            frame_width: frame_width.max(1) as f32,
            frame_height: frame_height.max(1) as f32,
            scale,
            offset_x: (INPUT_SIZE as u32 - scaled_width) as f32 / 2.0,
            offset_y: (INPUT_SIZE as u32 - scaled_height) as f32 / 2.0,
            scaled_width,
            scaled_height,
        }
    }

    /// Normalized model-input point to normalized frame point.
    pub fn to_frame(&self, p: Point) -> Point {
        let px = p.x * INPUT_SIZE as f32 - self.offset_x;
        let py = p.y * INPUT_SIZE as f32 - self.offset_y;
        Point::new(
            px / self.scale / self.frame_width,
            py / self.scale / self.frame_height,
        )
    }
}

/// Decode raw model outputs into frame-space candidates.
///
/// `regressors` is `[NUM_ANCHORS * 16]`, `logits` is `[NUM_ANCHORS]`.
pub fn decode(
    regressors: &[f32],
    logits: &[f32],
    anchors: &[Point],
    min_score: f32,
    letterbox: &Letterbox,
) -> Vec<RawDetection> {
    let size = INPUT_SIZE as f32;
    let mut out = Vec::new();

    for (i, anchor) in anchors.iter().enumerate() {
        let Some(&logit) = logits.get(i) else {
            break;
        };
        let score = sigmoid(logit.clamp(-SCORE_CLIP, SCORE_CLIP));
        if score < min_score {
            continue;
        }
        let Some(r) = regressors.get(i * NUM_COORDS..(i + 1) * NUM_COORDS) else {
            break;
        };

        let cx = r[0] / size + anchor.x;
        let cy = r[1] / size + anchor.y;
        let w = r[2] / size;
        let h = r[3] / size;

        let top_left = letterbox.to_frame(Point::new(cx - w / 2.0, cy - h / 2.0));
        let bottom_right = letterbox.to_frame(Point::new(cx + w / 2.0, cy + h / 2.0));

        let mut landmarks = [Point::default(); Landmarks::COUNT];
        for (k, lm) in landmarks.iter_mut().enumerate() {
            let kx = r[4 + k * 2] / size + anchor.x;
            let ky = r[5 + k * 2] / size + anchor.y;
            *lm = letterbox.to_frame(Point::new(kx, ky));
        }

        out.push(RawDetection {
            bounding_box: Rect::from_corners(top_left.x, top_left.y, bottom_right.x, bottom_right.y),
            landmarks,
            score,
        });
    }
    out
}

/// BlazeFace short-range model loaded into an ONNX Runtime session.
pub struct BlazeFaceModel {
    session: Session,
    anchors: Vec<Point>,
    min_score: f32,
}

impl BlazeFaceModel {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "BlazeFace detector loaded");

        Ok(Self {
            session,
            anchors: generate_anchors(),
            min_score: DEFAULT_MIN_CANDIDATE_SCORE,
        })
    }

    /// Letterbox and normalize a frame into a `[1, 3, 128, 128]` tensor.
    fn preprocess(frame: &Frame, letterbox: &Letterbox) -> Array4<f32> {
        let resized = imageops::resize(
            &frame.image,
            letterbox.scaled_width,
            letterbox.scaled_height,
            FilterType::Triangle,
        );

        // Padding stays at -1.0, i.e. black after normalization
        let mut tensor = Array4::<f32>::from_elem((1, 3, INPUT_SIZE, INPUT_SIZE), -1.0);
        let ox = letterbox.offset_x as usize;
        let oy = letterbox.offset_y as usize;
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = (ox + x as usize, oy + y as usize);
            if tx >= INPUT_SIZE || ty >= INPUT_SIZE {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = pixel[c] as f32 / 127.5 - 1.0;
            }
        }
        tensor
    }
}

impl DetectionModel for BlazeFaceModel {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>, DetectorError> {
        let letterbox = Letterbox::new(frame.width(), frame.height());
        let input = Self::preprocess(frame, &letterbox);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        // Output order differs between conversions; tell them apart by the last dimension
        let mut regressors = None;
        let mut logits = None;
        for (_name, output) in outputs.iter() {
            let (shape, data) = output.try_extract_tensor::<f32>()?;
            match shape.iter().last().copied() {
                Some(d) if d == NUM_COORDS as i64 => regressors = Some(data.to_vec()),
                Some(1) => logits = Some(data.to_vec()),
                _ => {}
            }
        }

        let (Some(regressors), Some(logits)) = (regressors, logits) else {
            return Err(DetectorError::InferenceFailed(
                "model did not produce regressor and score outputs".to_string(),
            ));
        };
        if logits.len() != NUM_ANCHORS || regressors.len() != NUM_ANCHORS * NUM_COORDS {
            return Err(DetectorError::InferenceFailed(format!(
                "expected {NUM_ANCHORS} anchors, got {} scores and {} regressors",
                logits.len(),
                regressors.len()
            )));
        }

        Ok(decode(
            &regressors,
            &logits,
            &self.anchors,
            self.min_score,
            &letterbox,
        ))
    }
}

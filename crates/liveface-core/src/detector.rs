//! Face detection: model inference plus confidence filtering and weighted
//! non-maximum suppression, reduced to a single per-frame classification.

use crate::frame::Frame;
use crate::geometry::{DetectedFace, Landmarks, Point, Rect};
use thiserror::Error;

/// Candidates below this confidence are discarded before merging.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.7;
/// Candidates overlapping a cluster's anchor at or above this IOU join the cluster.
pub const DEFAULT_MERGE_IOU_THRESHOLD: f32 = 0.3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// One unmerged candidate from a detection model, normalized to the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub bounding_box: Rect,
    pub landmarks: [Point; Landmarks::COUNT],
    pub score: f32,
}

/// Per-frame classification. Exactly one variant per processed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceDetection {
    NoFace,
    SingleFace(DetectedFace),
    MultipleFaces,
}

impl FaceDetection {
    pub fn from_faces(faces: Vec<DetectedFace>) -> Self {
        let mut faces = faces.into_iter();
        match (faces.next(), faces.next()) {
            (None, _) => FaceDetection::NoFace,
            (Some(face), None) => FaceDetection::SingleFace(face),
            (Some(_), Some(_)) => FaceDetection::MultipleFaces,
        }
    }
}

/// Inference backend producing raw candidates.
pub trait DetectionModel: Send {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>, DetectorError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    pub confidence_threshold: f32,
    pub merge_iou_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            merge_iou_threshold: DEFAULT_MERGE_IOU_THRESHOLD,
        }
    }
}

pub type DetectionHandler = Box<dyn FnMut(FaceDetection) + Send>;

/// Runs a [`DetectionModel`] on each frame and reports the classification to
/// the handler registered at construction.
pub struct FaceDetector {
    model: Box<dyn DetectionModel>,
    config: DetectorConfig,
    handler: DetectionHandler,
}

impl FaceDetector {
    pub fn new(model: Box<dyn DetectionModel>, config: DetectorConfig, handler: DetectionHandler) -> Self {
        Self {
            model,
            config,
            handler,
        }
    }

    /// Classify `frame` and hand the result to the handler.
    pub fn detect_faces(&mut self, frame: &Frame) {
        let result = self.classify(frame);
        (self.handler)(result);
    }

    /// Classify `frame`. Inference failures count as no face for this frame.
    pub fn classify(&mut self, frame: &Frame) -> FaceDetection {
        match self.model.infer(frame) {
            Ok(raw) => FaceDetection::from_faces(merge_detections(raw, &self.config)),
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed, treating frame as no face");
                FaceDetection::NoFace
            }
        }
    }
}

/// Confidence filter plus greedy weighted NMS.
///
/// Candidates are visited in descending confidence. Each unclaimed candidate
/// anchors a cluster of every remaining candidate overlapping it by at least
/// the merge threshold; the cluster collapses into one face whose box and
/// landmarks are the confidence-weighted mean of its members.
pub fn merge_detections(raw: Vec<RawDetection>, config: &DetectorConfig) -> Vec<DetectedFace> {
    let mut remaining: Vec<RawDetection> = raw
        .into_iter()
        .filter(|d| d.score >= config.confidence_threshold)
        .collect();
    remaining.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut faces = Vec::new();
    while !remaining.is_empty() {
        let anchor = remaining.remove(0);
        let (overlapping, rest): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|d| {
            anchor.bounding_box.intersection_over_union(&d.bounding_box)
                >= config.merge_iou_threshold
        });

        let mut cluster = Vec::with_capacity(overlapping.len() + 1);
        cluster.push(anchor);
        cluster.extend(overlapping);
        faces.push(weighted_average(&cluster));

        remaining = rest;
    }
    faces
}

fn weighted_average(cluster: &[RawDetection]) -> DetectedFace {
    let total: f32 = cluster.iter().map(|d| d.score).sum();

    let mut min_x = 0.0;
    let mut min_y = 0.0;
    let mut max_x = 0.0;
    let mut max_y = 0.0;
    let mut points = [Point::default(); Landmarks::COUNT];

    for d in cluster {
        let w = d.score / total;
        min_x += d.bounding_box.min_x() * w;
        min_y += d.bounding_box.min_y() * w;
        max_x += d.bounding_box.max_x() * w;
        max_y += d.bounding_box.max_y() * w;
        for (acc, p) in points.iter_mut().zip(d.landmarks.iter()) {
            acc.x += p.x * w;
            acc.y += p.y * w;
        }
    }

    DetectedFace {
        bounding_box: Rect::from_corners(min_x, min_y, max_x, max_y),
        landmarks: Landmarks::from_array(points),
        // Sorted descending, so the anchor carries the highest score
        confidence: cluster[0].score,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::RgbImage;
    use std::time::Duration;

    pub(crate) fn candidate(x: f32, y: f32, size: f32, score: f32) -> RawDetection {
        let c = Point::new(x + size / 2.0, y + size / 2.0);
        RawDetection {
            bounding_box: Rect::new(x, y, size, size),
            landmarks: [c; Landmarks::COUNT],
            score,
        }
    }

    struct FixedModel(Result<Vec<RawDetection>, ()>);

    impl DetectionModel for FixedModel {
        fn infer(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>, DetectorError> {
            self.0
                .clone()
                .map_err(|_| DetectorError::InferenceFailed("boom".into()))
        }
    }

    fn frame() -> Frame {
        Frame::new(RgbImage::new(4, 4), Duration::ZERO)
    }

    #[test]
    fn test_low_confidence_filtered() {
        let faces = merge_detections(
            vec![candidate(0.1, 0.1, 0.2, 0.69), candidate(0.5, 0.5, 0.2, 0.2)],
            &DetectorConfig::default(),
        );
        assert!(faces.is_empty());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let faces = merge_detections(
            vec![candidate(0.1, 0.1, 0.2, 0.7)],
            &DetectorConfig::default(),
        );
        assert_eq!(faces.len(), 1);
    }

    #[test]
    fn test_overlapping_candidates_merge_weighted() {
        // Same size, shifted by 0.02: IOU well above 0.3
        let faces = merge_detections(
            vec![candidate(0.10, 0.10, 0.2, 0.8), candidate(0.12, 0.10, 0.2, 0.9)],
            &DetectorConfig::default(),
        );
        assert_eq!(faces.len(), 1);
        let face = faces[0];
        // x = (0.12 * 0.9 + 0.10 * 0.8) / 1.7
        let expected_x = (0.12 * 0.9 + 0.10 * 0.8) / 1.7;
        assert!((face.bounding_box.x - expected_x).abs() < 1e-5);
        assert!((face.bounding_box.width - 0.2).abs() < 1e-5);
        assert!((face.confidence - 0.9).abs() < 1e-6);
        let expected_eye_x = expected_x + 0.1;
        assert!((face.landmarks.right_eye.x - expected_eye_x).abs() < 1e-5);
    }

    #[test]
    fn test_disjoint_candidates_stay_separate() {
        let faces = merge_detections(
            vec![
                candidate(0.05, 0.05, 0.2, 0.95),
                candidate(0.06, 0.05, 0.2, 0.9),
                candidate(0.6, 0.6, 0.2, 0.85),
            ],
            &DetectorConfig::default(),
        );
        assert_eq!(faces.len(), 2);
        assert!((faces[0].confidence - 0.95).abs() < 1e-6);
        assert!((faces[1].confidence - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_zero_area_candidate_does_not_loop() {
        let faces = merge_detections(
            vec![candidate(0.5, 0.5, 0.0, 0.9), candidate(0.5, 0.5, 0.0, 0.8)],
            &DetectorConfig::default(),
        );
        assert_eq!(faces.len(), 2);
    }

    #[test]
    fn test_classification_is_exclusive() {
        let f = weighted_average(&[candidate(0.1, 0.1, 0.2, 0.9)]);
        assert_eq!(FaceDetection::from_faces(vec![]), FaceDetection::NoFace);
        assert_eq!(
            FaceDetection::from_faces(vec![f]),
            FaceDetection::SingleFace(f)
        );
        assert_eq!(
            FaceDetection::from_faces(vec![f, f]),
            FaceDetection::MultipleFaces
        );
        assert_eq!(
            FaceDetection::from_faces(vec![f, f, f]),
            FaceDetection::MultipleFaces
        );
    }

    #[test]
    fn test_inference_failure_is_no_face() {
        let mut detector = FaceDetector::new(
            Box::new(FixedModel(Err(()))),
            DetectorConfig::default(),
            Box::new(|_| {}),
        );
        assert_eq!(detector.classify(&frame()), FaceDetection::NoFace);
    }

    #[test]
    fn test_handler_receives_result() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut detector = FaceDetector::new(
            Box::new(FixedModel(Ok(vec![candidate(0.3, 0.3, 0.3, 0.95)]))),
            DetectorConfig::default(),
            Box::new(move |r| tx.send(r).unwrap()),
        );
        detector.detect_faces(&frame());
        assert!(matches!(rx.recv().unwrap(), FaceDetection::SingleFace(_)));
    }
}

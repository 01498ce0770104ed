//! Normalized face geometry.
//!
//! Every coordinate in this module is normalized to the frame it came from:
//! `(0, 0)` is the top-left corner and `(1, 1)` the bottom-right. Faces are
//! produced once per processed frame and are never mutated; everything the
//! pipeline needs (eye line, face height, a landmark-derived box, a proximity
//! estimate) is derived on demand.

use serde::{Deserialize, Serialize};

/// Weight applied to the pupil distance when estimating face width from landmarks.
const PUPIL_DISTANCE_WEIGHT: f32 = 2.0;
/// Weight applied to the eye-to-mouth height when estimating face width.
const FACE_HEIGHT_WEIGHT: f32 = 1.8;
/// Height / width ratio of the landmark-derived face box.
const FACE_ASPECT_RATIO: f32 = 1.618;
/// Vertical position of the eye line within the landmark-derived box (0 = top).
const EYE_LINE_POSITION: f32 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn midpoint(&self, other: &Point) -> Point {
        Point::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }

    fn clamped(&self) -> Point {
        Point::new(self.x.clamp(0.0, 1.0), self.y.clamp(0.0, 1.0))
    }
}

/// Axis-aligned rectangle, origin at the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_corners(min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        Self::new(min_x, min_y, max_x - min_x, max_y - min_y)
    }

    pub fn min_x(&self) -> f32 {
        self.x
    }

    pub fn max_x(&self) -> f32 {
        self.x + self.width
    }

    pub fn min_y(&self) -> f32 {
        self.y
    }

    pub fn max_y(&self) -> f32 {
        self.y + self.height
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Overlapping region of two rectangles, `None` when they do not overlap.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let min_x = self.min_x().max(other.min_x());
        let min_y = self.min_y().max(other.min_y());
        let max_x = self.max_x().min(other.max_x());
        let max_y = self.max_y().min(other.max_y());

        if max_x <= min_x || max_y <= min_y {
            return None;
        }
        Some(Rect::from_corners(min_x, min_y, max_x, max_y))
    }

    /// Intersection-over-union in `[0, 1]`. Zero-area inputs yield 0.
    pub fn intersection_over_union(&self, other: &Rect) -> f32 {
        let Some(inter) = self.intersection(other) else {
            return 0.0;
        };
        let inter_area = inter.area();
        let union = self.area() + other.area() - inter_area;
        if union <= 0.0 {
            return 0.0;
        }
        inter_area / union
    }

    /// Clip to the unit square.
    pub fn clamped(&self) -> Rect {
        let min_x = self.min_x().clamp(0.0, 1.0);
        let min_y = self.min_y().clamp(0.0, 1.0);
        let max_x = self.max_x().clamp(0.0, 1.0);
        let max_y = self.max_y().clamp(0.0, 1.0);
        Rect::from_corners(min_x, min_y, max_x.max(min_x), max_y.max(min_y))
    }
}

/// Six facial keypoints in BlazeFace order. "Right" and "left" are from the
/// subject's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Landmarks {
    pub right_eye: Point,
    pub left_eye: Point,
    pub nose: Point,
    pub mouth: Point,
    pub right_ear: Point,
    pub left_ear: Point,
}

impl Landmarks {
    pub const COUNT: usize = 6;

    pub fn from_array(points: [Point; Self::COUNT]) -> Self {
        let [right_eye, left_eye, nose, mouth, right_ear, left_ear] = points;
        Self {
            right_eye,
            left_eye,
            nose,
            mouth,
            right_ear,
            left_ear,
        }
    }

    pub fn to_array(&self) -> [Point; Self::COUNT] {
        [
            self.right_eye,
            self.left_eye,
            self.nose,
            self.mouth,
            self.right_ear,
            self.left_ear,
        ]
    }
}

/// A single face found in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bounding_box: Rect,
    pub landmarks: Landmarks,
    /// Detector confidence in `(0, 1]`.
    pub confidence: f32,
}

impl DetectedFace {
    pub fn pupil_distance(&self) -> f32 {
        self.landmarks.left_eye.distance(&self.landmarks.right_eye)
    }

    pub fn eye_center(&self) -> Point {
        self.landmarks.left_eye.midpoint(&self.landmarks.right_eye)
    }

    /// Distance from the eye center to the mouth.
    pub fn face_height(&self) -> f32 {
        self.eye_center().distance(&self.landmarks.mouth)
    }

    /// Face box estimated from the keypoints alone.
    ///
    /// Detector boxes jitter and crop differently from model to model; the
    /// keypoint geometry is steadier and is what oval matching compares
    /// against the target region.
    pub fn landmark_bounding_box(&self) -> Rect {
        let width =
            (PUPIL_DISTANCE_WEIGHT * self.pupil_distance() + FACE_HEIGHT_WEIGHT * self.face_height())
                / 2.0;
        let height = FACE_ASPECT_RATIO * width;
        let eye_center = self.eye_center();
        let center_x = (eye_center.x + self.landmarks.nose.x) / 2.0;
        let top = eye_center.y - EYE_LINE_POSITION * height;
        Rect::new(center_x - width / 2.0, top, width, height)
    }

    /// Proximity estimate: the fraction of the frame width the face spans.
    /// Larger means closer to the camera.
    pub fn distance(&self) -> f32 {
        self.landmark_bounding_box().width
    }

    /// Copy of this face with the box and keypoints clipped to the frame.
    pub fn normalized(&self) -> DetectedFace {
        let points = self.landmarks.to_array().map(|p| p.clamped());
        DetectedFace {
            bounding_box: self.bounding_box.clamped(),
            landmarks: Landmarks::from_array(points),
            confidence: self.confidence,
        }
    }
}

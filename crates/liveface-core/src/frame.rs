//! Camera frames and the frame-source contract.

use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// One captured image plus its capture timestamp (monotonic, source-defined origin).
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: Duration,
}

impl Frame {
    pub fn new(image: RgbImage, timestamp: Duration) -> Self {
        Self { image, timestamp }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Error, Debug)]
pub enum FrameSourceError {
    #[error("camera access denied")]
    PermissionDenied,
    #[error("frame capture failed: {0}")]
    Capture(String),
    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Supplies frames at the sensor's nominal rate, in the sensor's fixed orientation.
///
/// `Ok(None)` means the stream ended. Implementations may block until the
/// next frame is available; they are driven from a dedicated capture thread.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>, FrameSourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    #[default]
    None,
    Clockwise90,
    Rotate180,
    Clockwise270,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Rotation::None),
            90 => Some(Rotation::Clockwise90),
            180 => Some(Rotation::Rotate180),
            270 => Some(Rotation::Clockwise270),
            _ => None,
        }
    }
}

/// How raw sensor frames map onto the upright, user-facing view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameOrientation {
    pub rotation: Rotation,
    /// Mirror horizontally after rotating (front camera selfie view).
    pub mirrored: bool,
}

impl FrameOrientation {
    pub fn apply(&self, image: RgbImage) -> RgbImage {
        let rotated = match self.rotation {
            Rotation::None => image,
            Rotation::Clockwise90 => imageops::rotate90(&image),
            Rotation::Rotate180 => imageops::rotate180(&image),
            Rotation::Clockwise270 => imageops::rotate270(&image),
        };
        if self.mirrored {
            imageops::flip_horizontal(&rotated)
        } else {
            rotated
        }
    }

    pub fn normalize(&self, frame: Frame) -> Frame {
        if *self == FrameOrientation::default() {
            return frame;
        }
        Frame {
            image: self.apply(frame.image),
            timestamp: frame.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn marked_image() -> RgbImage {
        // 3x2 image with a single red pixel in the top-left corner
        let mut img = RgbImage::new(3, 2);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img
    }

    #[test]
    fn test_rotation_from_degrees() {
        assert_eq!(Rotation::from_degrees(0), Some(Rotation::None));
        assert_eq!(Rotation::from_degrees(90), Some(Rotation::Clockwise90));
        assert_eq!(Rotation::from_degrees(450), Some(Rotation::Clockwise90));
        assert_eq!(Rotation::from_degrees(45), None);
    }

    #[test]
    fn test_rotate_swaps_dimensions() {
        let orientation = FrameOrientation {
            rotation: Rotation::Clockwise90,
            mirrored: false,
        };
        let out = orientation.apply(marked_image());
        assert_eq!(out.dimensions(), (2, 3));
        // Top-left moves to top-right after a clockwise quarter turn
        assert_eq!(out.get_pixel(1, 0), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_mirror_flips_horizontally() {
        let orientation = FrameOrientation {
            rotation: Rotation::None,
            mirrored: true,
        };
        let out = orientation.apply(marked_image());
        assert_eq!(out.get_pixel(2, 0), &Rgb([255, 0, 0]));
        assert_eq!(out.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_normalize_keeps_timestamp() {
        let orientation = FrameOrientation {
            rotation: Rotation::Rotate180,
            mirrored: false,
        };
        let frame = Frame::new(marked_image(), Duration::from_millis(40));
        let out = orientation.normalize(frame);
        assert_eq!(out.timestamp, Duration::from_millis(40));
        assert_eq!(out.image.get_pixel(2, 1), &Rgb([255, 0, 0]));
    }
}

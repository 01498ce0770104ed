//! Challenge parameters delivered by the verification service.

use crate::geometry::Rect;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rgb(pub [u8; 3]);

impl Rgb {
    pub const fn new(red: u8, green: u8, blue: u8) -> Self {
        Self([red, green, blue])
    }
}

/// One step of the freshness color sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessColor {
    pub rgb: Rgb,
    pub duration_ms: u64,
    /// Animate the transition into this color as a downward scroll instead of a flat fill.
    #[serde(default)]
    pub scroll: bool,
}

impl FreshnessColor {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ChallengeConfigError {
    #[error("target region must have positive area inside the frame, got {0:?}")]
    InvalidTargetRegion(Rect),
    #[error("{name} must be in (0, 1], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f32 },
    #[error("color sequence is empty")]
    EmptyColorSequence,
}

/// Server-provided challenge. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeConfig {
    /// Region the face has to fill, normalized to the frame.
    pub target_region: Rect,
    /// Minimum face/target intersection-over-union for a match.
    pub iou_threshold: f32,
    /// Horizontal edge tolerance, as a fraction of the target width.
    pub iou_width_threshold: f32,
    /// Vertical edge tolerance, as a fraction of the target height.
    pub iou_height_threshold: f32,
    pub colors: Vec<FreshnessColor>,
}

impl ChallengeConfig {
    pub fn validate(&self) -> Result<(), ChallengeConfigError> {
        let r = self.target_region;
        let inside = r.min_x() >= 0.0 && r.min_y() >= 0.0 && r.max_x() <= 1.0 && r.max_y() <= 1.0;
        if r.area() <= 0.0 || !inside {
            return Err(ChallengeConfigError::InvalidTargetRegion(r));
        }

        for (name, value) in [
            ("iou_threshold", self.iou_threshold),
            ("iou_width_threshold", self.iou_width_threshold),
            ("iou_height_threshold", self.iou_height_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ChallengeConfigError::ThresholdOutOfRange { name, value });
            }
        }

        if self.colors.is_empty() {
            return Err(ChallengeConfigError::EmptyColorSequence);
        }
        Ok(())
    }

    /// Total time the color sequence takes to display.
    pub fn freshness_duration(&self) -> Duration {
        self.colors.iter().map(FreshnessColor::duration).sum()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_challenge() -> ChallengeConfig {
        ChallengeConfig {
            target_region: Rect::new(0.3, 0.2, 0.4, 0.6),
            iou_threshold: 0.7,
            iou_width_threshold: 0.15,
            iou_height_threshold: 0.15,
            colors: vec![
                FreshnessColor {
                    rgb: Rgb::new(255, 255, 255),
                    duration_ms: 75,
                    scroll: false,
                },
                FreshnessColor {
                    rgb: Rgb::new(255, 0, 0),
                    duration_ms: 475,
                    scroll: true,
                },
                FreshnessColor {
                    rgb: Rgb::new(0, 0, 255),
                    duration_ms: 475,
                    scroll: true,
                },
            ],
        }
    }

    #[test]
    fn test_sample_is_valid() {
        let challenge = sample_challenge();
        assert_eq!(challenge.validate(), Ok(()));
        assert_eq!(challenge.freshness_duration(), Duration::from_millis(1025));
    }

    #[test]
    fn test_rejects_region_outside_frame() {
        let mut challenge = sample_challenge();
        challenge.target_region = Rect::new(0.8, 0.2, 0.4, 0.6);
        assert!(matches!(
            challenge.validate(),
            Err(ChallengeConfigError::InvalidTargetRegion(_))
        ));
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let mut challenge = sample_challenge();
        challenge.iou_width_threshold = 0.0;
        assert!(matches!(
            challenge.validate(),
            Err(ChallengeConfigError::ThresholdOutOfRange {
                name: "iou_width_threshold",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_empty_colors() {
        let mut challenge = sample_challenge();
        challenge.colors.clear();
        assert_eq!(
            challenge.validate(),
            Err(ChallengeConfigError::EmptyColorSequence)
        );
    }

    #[test]
    fn test_deserializes_from_json() {
        let json = r#"{
            "target_region": {"x": 0.25, "y": 0.2, "width": 0.5, "height": 0.6},
            "iou_threshold": 0.7,
            "iou_width_threshold": 0.15,
            "iou_height_threshold": 0.15,
            "colors": [{"rgb": [0, 255, 0], "duration_ms": 100}]
        }"#;
        let challenge: ChallengeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(challenge.colors[0].rgb, Rgb::new(0, 255, 0));
        assert!(!challenge.colors[0].scroll);
        assert_eq!(challenge.validate(), Ok(()));
    }
}

//! Oval matching: tells the user how to move so their face fills the target region.
//!
//! Per-frame detection is noisy, so raw instructions are debounced: an
//! instruction is only surfaced once it has been produced for
//! [`DEFAULT_HYSTERESIS_FRAMES`] consecutive frames. Until then the
//! instructor reports [`Instruction::None`].

use crate::challenge::ChallengeConfig;
use crate::geometry::Rect;
use serde::Serialize;
use std::mem;

/// Consecutive identical instructions required before one is surfaced.
pub const DEFAULT_HYSTERESIS_FRAMES: u32 = 15;

/// Guidance for the user. `nearness` in `[0, 1]` tracks progress from the
/// first measured fit toward a match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Instruction {
    Match,
    TooFar { nearness: f32 },
    TooClose { nearness: f32 },
    TooFarLeft { nearness: f32 },
    TooFarRight { nearness: f32 },
    None,
}

impl Instruction {
    pub fn is_match(&self) -> bool {
        matches!(self, Instruction::Match)
    }

    pub fn nearness(&self) -> Option<f32> {
        match *self {
            Instruction::TooFar { nearness }
            | Instruction::TooClose { nearness }
            | Instruction::TooFarLeft { nearness }
            | Instruction::TooFarRight { nearness } => Some(nearness),
            Instruction::Match | Instruction::None => None,
        }
    }

    /// Same variant, ignoring the nearness payload.
    pub fn same_kind(&self, other: &Instruction) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }
}

/// Session-scoped oval matcher. Create one per session: the baseline IOU is
/// taken from the first evaluated frame and never reset.
#[derive(Debug)]
pub struct OvalMatchInstructor {
    initial_iou: Option<f32>,
    previous: Option<Instruction>,
    run_length: u32,
    required_run: u32,
    percentage: f32,
}

impl Default for OvalMatchInstructor {
    fn default() -> Self {
        Self::new()
    }
}

impl OvalMatchInstructor {
    pub fn new() -> Self {
        Self::with_hysteresis(DEFAULT_HYSTERESIS_FRAMES)
    }

    pub fn with_hysteresis(required_run: u32) -> Self {
        Self {
            initial_iou: None,
            previous: None,
            run_length: 0,
            required_run: required_run.max(1),
            percentage: 0.0,
        }
    }

    /// Debounced instruction for this frame.
    pub fn face_match_state(
        &mut self,
        face: &Rect,
        target: &Rect,
        config: &ChallengeConfig,
    ) -> Instruction {
        let raw = self.evaluate(face, target, config);
        self.debounce(raw)
    }

    /// Raw, undebounced instruction. Records the baseline IOU on first use.
    pub fn evaluate(&mut self, face: &Rect, target: &Rect, config: &ChallengeConfig) -> Instruction {
        let iou = face.intersection_over_union(target);
        let baseline = *self.initial_iou.get_or_insert(iou);
        let threshold = config.iou_threshold;

        let nearness = nearness(iou, baseline, threshold);
        self.percentage = nearness;

        let width_tolerance = target.width * config.iou_width_threshold;
        let height_tolerance = target.height * config.iou_height_threshold;

        let is_match = iou > threshold
            && (target.min_x() - face.min_x()).abs() < width_tolerance
            && (target.max_x() - face.max_x()).abs() < width_tolerance
            && (target.max_y() - face.max_y()).abs() < height_tolerance;
        if is_match {
            return Instruction::Match;
        }

        let too_close = (target.min_y() - face.min_y()) > height_tolerance
            || (face.max_y() - target.max_y()) > height_tolerance
            || ((target.min_x() - face.min_x()) > width_tolerance
                && (face.max_x() - target.max_x()) > width_tolerance);
        if too_close {
            return Instruction::TooClose { nearness };
        }

        if face.max_x() <= target.min_x() {
            Instruction::TooFarLeft { nearness }
        } else if face.min_x() >= target.max_x() {
            Instruction::TooFarRight { nearness }
        } else {
            Instruction::TooFar { nearness }
        }
    }

    fn debounce(&mut self, raw: Instruction) -> Instruction {
        let repeated = self.previous.is_some_and(|prev| prev.same_kind(&raw));
        if !repeated {
            self.run_length = 0;
        }
        self.previous = Some(raw);
        self.run_length = self.run_length.saturating_add(1);

        if self.run_length >= self.required_run {
            raw
        } else {
            Instruction::None
        }
    }

    /// Match progress from the most recent evaluation, in `[0, 1]`.
    pub fn percentage(&self) -> f32 {
        self.percentage
    }

    pub fn initial_iou(&self) -> Option<f32> {
        self.initial_iou
    }
}

fn nearness(iou: f32, baseline: f32, threshold: f32) -> f32 {
    let span = threshold - baseline;
    if span.abs() <= f32::EPSILON {
        return if iou >= threshold { 1.0 } else { 0.0 };
    }
    ((iou - baseline) / span).clamp(0.0, 1.0)
}

//! Timed color sequence shown once the face is matched.

use crate::challenge::FreshnessColor;

/// A color that has just started displaying.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorChange {
    pub sequence_number: u32,
    pub color: FreshnessColor,
    /// For the first color this is the color itself.
    pub previous: FreshnessColor,
    pub started_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FreshnessStep {
    /// A new color must be displayed now.
    Display(ColorChange),
    /// The current color is still within its duration.
    Idle,
    /// The last color's duration elapsed. Reported exactly once.
    Completed { finished_at_ms: u64 },
}

/// Clock-driven walk through the challenge colors. Call [`advance`](Self::advance)
/// periodically with the current time.
#[derive(Debug, Clone)]
pub struct FreshnessSequence {
    colors: Vec<FreshnessColor>,
    current: Option<(usize, u64)>,
    finished: bool,
}

impl FreshnessSequence {
    pub fn new(colors: Vec<FreshnessColor>) -> Self {
        Self {
            colors,
            current: None,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn advance(&mut self, now_ms: u64) -> FreshnessStep {
        if self.finished {
            return FreshnessStep::Idle;
        }

        let next_index = match self.current {
            None => 0,
            Some((index, started_at)) => {
                let elapsed = now_ms.saturating_sub(started_at);
                if elapsed < self.colors[index].duration_ms {
                    return FreshnessStep::Idle;
                }
                index + 1
            }
        };

        let Some(&color) = self.colors.get(next_index) else {
            self.finished = true;
            self.current = None;
            return FreshnessStep::Completed {
                finished_at_ms: now_ms,
            };
        };

        let previous = match self.current {
            Some((index, _)) => self.colors[index],
            None => color,
        };
        self.current = Some((next_index, now_ms));

        FreshnessStep::Display(ColorChange {
            sequence_number: next_index as u32,
            color,
            previous,
            started_at_ms: now_ms,
        })
    }
}

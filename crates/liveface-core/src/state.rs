//! Liveness session state machine.
//!
//! [`LivenessState`] is a plain sum type and [`LivenessState::on`] is the
//! whole transition table: given the current state and a [`Transition`] it
//! returns the next state, or `None` when the transition is not valid from
//! here. [`LivenessStateMachine`] owns the single mutable state of a session
//! and is the only place that applies transitions.

use crate::instructor::Instruction;
use serde::Serialize;
use thiserror::Error;

/// Why the face is not yet ready for recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceNotPreparedReason {
    PendingCheck,
    NoFace,
    MultipleFaces,
    FaceTooClose,
}

/// Reasons a session ends without completing. The presentation layer maps
/// these to user-facing text; no raw internal errors leak past this type.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessError {
    #[error("camera permission is required")]
    MissingVideoPermission,
    #[error("camera or media framework failure")]
    FrameworkFailure,
    #[error("cancelled by user")]
    UserCancelled,
    #[error("face did not fit the target region in time")]
    TimedOut,
    #[error("could not open the verification stream")]
    CouldNotOpenStream,
    #[error("verification stream closed unexpectedly")]
    SocketClosed,
    #[error("face moved during the color challenge")]
    InvalidFaceMovementDuringCountdown,
    #[error("unknown error")]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LivenessState {
    Initial,
    PendingFacePreparedConfirmation {
        reason: FaceNotPreparedReason,
    },
    WaitForRecording,
    Recording {
        oval_displayed: bool,
    },
    AwaitingFaceInOvalMatch {
        instruction: Instruction,
        percentage: f32,
    },
    FaceMatched,
    DisplayingFreshness,
    CompletedDisplayingFreshness,
    Completed,
    EncounteredUnrecoverableError {
        error: LivenessError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    CheckIsFacePrepared,
    FaceNotPrepared(FaceNotPreparedReason),
    WaitForRecording,
    BeginRecording,
    OvalDisplayed,
    AwaitingFaceMatch {
        instruction: Instruction,
        percentage: f32,
    },
    FaceMatched,
    StartDisplayingFreshness,
    CompletedDisplayingFreshness,
    Complete,
    Unrecoverable(LivenessError),
}

impl LivenessState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LivenessState::Completed | LivenessState::EncounteredUnrecoverableError { .. }
        )
    }

    /// Next state for `transition`, or `None` if it does not apply here.
    /// Terminal states accept nothing.
    pub fn on(&self, transition: Transition) -> Option<LivenessState> {
        use LivenessState as S;
        use Transition as T;

        if self.is_terminal() {
            return None;
        }

        match (self, transition) {
            (S::Initial, T::CheckIsFacePrepared) => Some(S::PendingFacePreparedConfirmation {
                reason: FaceNotPreparedReason::PendingCheck,
            }),
            (S::PendingFacePreparedConfirmation { .. }, T::FaceNotPrepared(reason)) => {
                Some(S::PendingFacePreparedConfirmation { reason })
            }
            (S::PendingFacePreparedConfirmation { .. }, T::WaitForRecording) => {
                Some(S::WaitForRecording)
            }
            (S::WaitForRecording, T::BeginRecording) => Some(S::Recording {
                oval_displayed: false,
            }),
            (
                S::Recording {
                    oval_displayed: false,
                },
                T::OvalDisplayed,
            ) => Some(S::Recording {
                oval_displayed: true,
            }),
            (
                S::Recording {
                    oval_displayed: true,
                }
                | S::AwaitingFaceInOvalMatch { .. },
                T::AwaitingFaceMatch {
                    instruction,
                    percentage,
                },
            ) => Some(S::AwaitingFaceInOvalMatch {
                instruction,
                percentage,
            }),
            (
                S::Recording {
                    oval_displayed: true,
                }
                | S::AwaitingFaceInOvalMatch { .. },
                T::FaceMatched,
            ) => Some(S::FaceMatched),
            (S::FaceMatched, T::StartDisplayingFreshness) => Some(S::DisplayingFreshness),
            (S::DisplayingFreshness, T::CompletedDisplayingFreshness) => {
                Some(S::CompletedDisplayingFreshness)
            }
            (_, T::Complete) => Some(S::Completed),
            (_, T::Unrecoverable(error)) => Some(S::EncounteredUnrecoverableError { error }),
            _ => None,
        }
    }
}

/// Owner of a session's single state value.
///
/// Every transition method returns `true` when the state changed. Calls made
/// from a state that does not satisfy the transition's precondition leave
/// the state untouched.
#[derive(Debug)]
pub struct LivenessStateMachine {
    state: LivenessState,
}

impl Default for LivenessStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessStateMachine {
    pub fn new() -> Self {
        Self {
            state: LivenessState::Initial,
        }
    }

    pub fn state(&self) -> &LivenessState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn apply(&mut self, transition: Transition) -> bool {
        match self.state.on(transition) {
            Some(next) => {
                if next != self.state {
                    tracing::debug!(from = ?self.state, to = ?next, "liveness state changed");
                }
                self.state = next;
                true
            }
            None => {
                tracing::debug!(
                    state = ?self.state,
                    transition = ?transition,
                    "ignoring transition not valid from current state"
                );
                false
            }
        }
    }

    pub fn check_is_face_prepared(&mut self) -> bool {
        self.apply(Transition::CheckIsFacePrepared)
    }

    pub fn face_not_prepared(&mut self, reason: FaceNotPreparedReason) -> bool {
        self.apply(Transition::FaceNotPrepared(reason))
    }

    pub fn wait_for_recording(&mut self) -> bool {
        self.apply(Transition::WaitForRecording)
    }

    pub fn begin_recording(&mut self) -> bool {
        self.apply(Transition::BeginRecording)
    }

    pub fn oval_displayed(&mut self) -> bool {
        self.apply(Transition::OvalDisplayed)
    }

    pub fn awaiting_face_match(&mut self, instruction: Instruction, percentage: f32) -> bool {
        self.apply(Transition::AwaitingFaceMatch {
            instruction,
            percentage,
        })
    }

    pub fn face_matched(&mut self) -> bool {
        self.apply(Transition::FaceMatched)
    }

    pub fn start_displaying_freshness(&mut self) -> bool {
        self.apply(Transition::StartDisplayingFreshness)
    }

    pub fn completed_displaying_freshness(&mut self) -> bool {
        self.apply(Transition::CompletedDisplayingFreshness)
    }

    pub fn complete(&mut self) -> bool {
        self.apply(Transition::Complete)
    }

    /// Enter the error state. Idempotent: the first error wins and nothing
    /// replaces a completed session.
    pub fn unrecoverable_state_encountered(&mut self, error: LivenessError) -> bool {
        if self.state.is_terminal() {
            tracing::debug!(state = ?self.state, dropped = ?error, "session already ended, dropping error");
            return false;
        }
        tracing::warn!(error = ?error, from = ?self.state, "unrecoverable liveness error");
        self.apply(Transition::Unrecoverable(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_with_oval() -> LivenessStateMachine {
        let mut sm = LivenessStateMachine::new();
        assert!(sm.check_is_face_prepared());
        assert!(sm.wait_for_recording());
        assert!(sm.begin_recording());
        assert!(sm.oval_displayed());
        sm
    }

    #[test]
    fn test_happy_path() {
        let mut sm = recording_with_oval();
        assert!(sm.awaiting_face_match(Instruction::TooFar { nearness: 0.2 }, 0.2));
        assert!(matches!(
            sm.state(),
            LivenessState::AwaitingFaceInOvalMatch { .. }
        ));
        assert!(sm.face_matched());
        assert!(sm.start_displaying_freshness());
        assert!(sm.completed_displaying_freshness());
        assert!(sm.complete());
        assert_eq!(sm.state(), &LivenessState::Completed);
        assert!(sm.is_terminal());
    }

    #[test]
    fn test_initial_check_sets_pending_reason() {
        let mut sm = LivenessStateMachine::new();
        sm.check_is_face_prepared();
        assert_eq!(
            sm.state(),
            &LivenessState::PendingFacePreparedConfirmation {
                reason: FaceNotPreparedReason::PendingCheck
            }
        );
        assert!(sm.face_not_prepared(FaceNotPreparedReason::MultipleFaces));
        assert_eq!(
            sm.state(),
            &LivenessState::PendingFacePreparedConfirmation {
                reason: FaceNotPreparedReason::MultipleFaces
            }
        );
    }

    #[test]
    fn test_begin_recording_requires_wait_state() {
        let mut sm = LivenessStateMachine::new();
        sm.check_is_face_prepared();
        assert!(!sm.begin_recording());
        assert!(matches!(
            sm.state(),
            LivenessState::PendingFacePreparedConfirmation { .. }
        ));
    }

    #[test]
    fn test_face_matched_requires_oval() {
        let mut sm = LivenessStateMachine::new();
        sm.check_is_face_prepared();
        sm.wait_for_recording();
        sm.begin_recording();
        assert!(!sm.face_matched());
        assert!(!sm.awaiting_face_match(Instruction::None, 0.0));
        assert_eq!(
            sm.state(),
            &LivenessState::Recording {
                oval_displayed: false
            }
        );
    }

    #[test]
    fn test_first_error_wins() {
        let mut sm = recording_with_oval();
        assert!(sm.unrecoverable_state_encountered(LivenessError::TimedOut));
        assert!(!sm.unrecoverable_state_encountered(LivenessError::SocketClosed));
        assert_eq!(
            sm.state(),
            &LivenessState::EncounteredUnrecoverableError {
                error: LivenessError::TimedOut
            }
        );
    }

    #[test]
    fn test_completed_ignores_errors() {
        let mut sm = LivenessStateMachine::new();
        sm.complete();
        assert!(!sm.unrecoverable_state_encountered(LivenessError::Unknown));
        assert_eq!(sm.state(), &LivenessState::Completed);
    }

    #[test]
    fn test_terminal_states_absorb_everything() {
        let err = LivenessState::EncounteredUnrecoverableError {
            error: LivenessError::UserCancelled,
        };
        for t in [
            Transition::CheckIsFacePrepared,
            Transition::BeginRecording,
            Transition::FaceMatched,
            Transition::Complete,
        ] {
            assert_eq!(err.on(t), None);
            assert_eq!(LivenessState::Completed.on(t), None);
        }
    }

    #[test]
    fn test_error_reachable_from_every_non_terminal_state() {
        let states = [
            LivenessState::Initial,
            LivenessState::WaitForRecording,
            LivenessState::Recording {
                oval_displayed: true,
            },
            LivenessState::FaceMatched,
            LivenessState::DisplayingFreshness,
            LivenessState::CompletedDisplayingFreshness,
        ];
        for s in states {
            assert_eq!(
                s.on(Transition::Unrecoverable(LivenessError::Unknown)),
                Some(LivenessState::EncounteredUnrecoverableError {
                    error: LivenessError::Unknown
                })
            );
        }
    }
}

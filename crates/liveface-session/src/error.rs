use liveface_core::challenge::ChallengeConfigError;
use liveface_core::chunker::ChunkerError;
use liveface_core::events::ChannelError;
use liveface_core::frame::FrameSourceError;
use liveface_core::state::LivenessError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("capture error: {0}")]
    Capture(#[from] FrameSourceError),
    #[error("chunker error: {0}")]
    Chunker(#[from] ChunkerError),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("invalid challenge: {0}")]
    Challenge(#[from] ChallengeConfigError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
    #[error("session task exited")]
    TaskClosed,
}

impl SessionError {
    /// The user-facing reason this error ends the session with.
    pub fn liveness_error(&self) -> LivenessError {
        match self {
            SessionError::Capture(FrameSourceError::PermissionDenied) => {
                LivenessError::MissingVideoPermission
            }
            SessionError::Capture(_) => LivenessError::FrameworkFailure,
            SessionError::Chunker(ChunkerError::SegmentBeforeInitialization) => {
                LivenessError::Unknown
            }
            SessionError::Chunker(ChunkerError::Encoder(_)) => LivenessError::FrameworkFailure,
            SessionError::Channel(ChannelError::Open(_)) => LivenessError::CouldNotOpenStream,
            SessionError::Channel(_) => LivenessError::SocketClosed,
            SessionError::Challenge(_) => LivenessError::Unknown,
            SessionError::Spawn { .. } => LivenessError::FrameworkFailure,
            SessionError::TaskClosed => LivenessError::Unknown,
        }
    }
}

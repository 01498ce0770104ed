//! liveface-session: runs a liveness session end to end.
//!
//! [`spawn_session`] wires a frame source, a detection model, a segmenting
//! encoder and an event channel to the [`SessionOrchestrator`], and returns a
//! [`SessionHandle`] that resolves to the terminal state.

mod capture;
pub mod config;
pub mod encoder;
pub mod error;
pub mod orchestrator;
pub mod retry;
mod runtime;
pub mod segmenter;

pub use config::SessionConfig;
pub use encoder::BackgroundEncoder;
pub use error::SessionError;
pub use orchestrator::{CaptureCommand, OrchestratorLinks, PresentationEvent, SessionOrchestrator};
pub use retry::RetryPolicy;
pub use runtime::{spawn_session, SessionComponents, SessionHandle};
pub use segmenter::MjpegSegmenter;

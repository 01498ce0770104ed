//! liveface-core: building blocks of the face-liveness pipeline.
//!
//! Everything here is synchronous and free of threads: frames go into the
//! [`detector`], faces into the [`instructor`], and the [`state`] machine
//! records where the session stands. The `liveface-session` crate wires
//! these together with capture threads and the event channel.

pub mod blazeface;
pub mod challenge;
pub mod chunker;
pub mod clock;
pub mod detector;
pub mod events;
pub mod frame;
pub mod freshness;
pub mod geometry;
pub mod instructor;
pub mod state;

pub use challenge::{ChallengeConfig, FreshnessColor, Rgb};
pub use chunker::{Segment, SegmentEncoder, VideoChunkAssembler, VideoChunker, VideoSegment};
pub use clock::{Clock, ManualClock, SystemClock};
pub use detector::{DetectionModel, DetectorConfig, FaceDetection, FaceDetector};
pub use events::{ClientEvent, DisconnectReason, EventChannel, ServiceEvent, ServiceEventSink};
pub use frame::{Frame, FrameOrientation, FrameSource, FrameSourceError, Rotation};
pub use geometry::{DetectedFace, Landmarks, Point, Rect};
pub use instructor::{Instruction, OvalMatchInstructor};
pub use state::{FaceNotPreparedReason, LivenessError, LivenessState, LivenessStateMachine};

//! Video chunker: feeds frames to a segmenting encoder and turns its output
//! into self-contained chunks.
//!
//! The encoder emits one initialization segment followed by separable media
//! segments. The initialization segment is buffered, never forwarded on its
//! own, and travels with every [`VideoSegment`] so the consumer can decide
//! where it has to be prefixed (see [`VideoChunkAssembler`]).

use crate::frame::Frame;
use image::RgbImage;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Encoder output unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Initialization(Vec<u8>),
    Separable(Vec<u8>),
}

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("encoder already finished")]
    Finished,
    #[error("frame size changed from {expected:?} to {got:?}")]
    FrameSizeChanged { expected: (u32, u32), got: (u32, u32) },
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("encoder worker stopped")]
    WorkerStopped,
}

#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("media segment received before the initialization segment")]
    SegmentBeforeInitialization,
    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),
}

/// Segmenting video encoder.
///
/// `append` may return zero or more finished segments; the very first
/// segment produced must be [`Segment::Initialization`].
pub trait SegmentEncoder: Send {
    /// Backpressure signal. Frames offered while this is false are dropped.
    fn is_ready_for_more_data(&self) -> bool;
    fn append(&mut self, frame: &Frame, pts: Duration) -> Result<Vec<Segment>, EncoderError>;
    /// Flush buffered frames. No appends are accepted afterwards.
    fn finish(&mut self) -> Result<Vec<Segment>, EncoderError>;
}

/// A separable segment plus the stream's initialization segment.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoSegment {
    pub initialization: Arc<[u8]>,
    pub current: Vec<u8>,
}

pub type SegmentProcessor = Box<dyn FnMut(VideoSegment) + Send>;
pub type StillFrameCallback = Box<dyn FnOnce(RgbImage) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkerState {
    Pending,
    Writing,
    AwaitingSingleFrame,
    Complete,
}

pub struct VideoChunker {
    encoder: Box<dyn SegmentEncoder>,
    processor: SegmentProcessor,
    state: ChunkerState,
    initialization: Option<Arc<[u8]>>,
    first_timestamp: Option<Duration>,
    still_frame: Option<StillFrameCallback>,
    dropped_frames: u64,
}

impl fmt::Debug for VideoChunker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoChunker")
            .field("state", &self.state)
            .field("initialized", &self.initialization.is_some())
            .field("dropped_frames", &self.dropped_frames)
            .finish_non_exhaustive()
    }
}

impl VideoChunker {
    pub fn new(encoder: Box<dyn SegmentEncoder>, processor: SegmentProcessor) -> Self {
        Self {
            encoder,
            processor,
            state: ChunkerState::Pending,
            initialization: None,
            first_timestamp: None,
            still_frame: None,
            dropped_frames: 0,
        }
    }

    pub fn state(&self) -> ChunkerState {
        self.state
    }

    /// Frames skipped because the encoder was not ready.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Begin writing. Only valid from [`ChunkerState::Pending`].
    pub fn start(&mut self) -> bool {
        if self.state != ChunkerState::Pending {
            tracing::debug!(state = ?self.state, "chunker already started");
            return false;
        }
        self.state = ChunkerState::Writing;
        true
    }

    pub fn consume(&mut self, frame: &Frame) -> Result<(), ChunkerError> {
        match self.state {
            ChunkerState::Pending | ChunkerState::Complete => Ok(()),
            ChunkerState::AwaitingSingleFrame => {
                self.state = ChunkerState::Complete;
                if let Some(callback) = self.still_frame.take() {
                    callback(frame.image.clone());
                }
                Ok(())
            }
            ChunkerState::Writing => {
                let first = *self.first_timestamp.get_or_insert(frame.timestamp);
                if !self.encoder.is_ready_for_more_data() {
                    self.dropped_frames += 1;
                    tracing::trace!(dropped = self.dropped_frames, "encoder busy, dropping frame");
                    return Ok(());
                }
                let pts = frame.timestamp.saturating_sub(first);
                let segments = self.encoder.append(frame, pts)?;
                self.handle_segments(segments)
            }
        }
    }

    /// Stop writing and ask for one still frame. The callback runs with the
    /// next consumed frame. Trailing segments from the encoder are still
    /// forwarded to the processor.
    pub fn finish(&mut self, callback: StillFrameCallback) -> Result<(), ChunkerError> {
        let was_writing = match self.state {
            ChunkerState::Writing => true,
            ChunkerState::Pending => false,
            ChunkerState::AwaitingSingleFrame | ChunkerState::Complete => {
                tracing::debug!(state = ?self.state, "chunker already finishing");
                return Ok(());
            }
        };

        self.still_frame = Some(callback);
        self.state = ChunkerState::AwaitingSingleFrame;

        if was_writing {
            let trailing = self.encoder.finish()?;
            self.handle_segments(trailing)?;
        }
        if self.dropped_frames > 0 {
            tracing::info!(dropped = self.dropped_frames, "frames dropped while encoder was busy");
        }
        Ok(())
    }

    fn handle_segments(&mut self, segments: Vec<Segment>) -> Result<(), ChunkerError> {
        for segment in segments {
            match segment {
                Segment::Initialization(bytes) => {
                    if self.initialization.is_some() {
                        tracing::warn!("ignoring repeated initialization segment");
                        continue;
                    }
                    tracing::debug!(bytes = bytes.len(), "buffered initialization segment");
                    self.initialization = Some(Arc::from(bytes));
                }
                Segment::Separable(current) => {
                    let Some(initialization) = self.initialization.clone() else {
                        return Err(ChunkerError::SegmentBeforeInitialization);
                    };
                    (self.processor)(VideoSegment {
                        initialization,
                        current,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Builds the bytes of each outbound video chunk. The first chunk carries
/// the initialization segment, later ones only their media segment.
#[derive(Debug, Default)]
pub struct VideoChunkAssembler {
    has_sent_first_video: bool,
}

impl VideoChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk(&mut self, initialization: &[u8], current: &[u8]) -> Vec<u8> {
        if self.has_sent_first_video {
            return current.to_vec();
        }
        self.has_sent_first_video = true;
        let mut out = Vec::with_capacity(initialization.len() + current.len());
        out.extend_from_slice(initialization);
        out.extend_from_slice(current);
        out
    }

    pub fn has_sent_first_video(&self) -> bool {
        self.has_sent_first_video
    }
}

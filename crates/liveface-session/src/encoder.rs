//! Encoder worker thread.
//!
//! [`BackgroundEncoder`] wraps any [`SegmentEncoder`] and runs it on a
//! dedicated `liveface-encoder` thread, so JPEG compression never sits on
//! the frame-acquisition path. It accepts one frame at a time: while a frame
//! is queued or being encoded it reports not-ready and the chunker drops
//! what the camera delivers in the meantime. Finished segments are picked
//! up on the next `append` and flushed by `finish`.

use crate::error::SessionError;
use liveface_core::chunker::{EncoderError, Segment, SegmentEncoder};
use liveface_core::frame::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

enum EncodeRequest {
    Append(Frame, Duration),
    Finish,
}

type EncodeResult = Result<Vec<Segment>, EncoderError>;

pub struct BackgroundEncoder {
    requests: mpsc::Sender<EncodeRequest>,
    results: mpsc::UnboundedReceiver<EncodeResult>,
    busy: Arc<AtomicBool>,
    finished: bool,
}

impl BackgroundEncoder {
    pub fn spawn(mut inner: Box<dyn SegmentEncoder>) -> Result<Self, SessionError> {
        let (requests, mut rx) = mpsc::channel::<EncodeRequest>(1);
        let (results_tx, results) = mpsc::unbounded_channel();
        let busy = Arc::new(AtomicBool::new(false));
        let worker_busy = busy.clone();

        std::thread::Builder::new()
            .name("liveface-encoder".into())
            .spawn(move || {
                tracing::info!("encoder thread started");
                while let Some(request) = rx.blocking_recv() {
                    let (result, last) = match request {
                        EncodeRequest::Append(frame, pts) => (inner.append(&frame, pts), false),
                        EncodeRequest::Finish => (inner.finish(), true),
                    };
                    if let Err(e) = &result {
                        tracing::warn!(error = %e, "encoding failed");
                    }
                    // Publish before clearing so the next append sees it
                    let delivered = results_tx.send(result).is_ok();
                    worker_busy.store(false, Ordering::Release);
                    if !delivered || last {
                        break;
                    }
                }
                tracing::info!("encoder thread exiting");
            })
            .map_err(|source| SessionError::Spawn {
                name: "encoder",
                source,
            })?;

        Ok(Self {
            requests,
            results,
            busy,
            finished: false,
        })
    }

    /// Segments the worker has produced so far.
    fn collect(&mut self) -> EncodeResult {
        let mut out = Vec::new();
        loop {
            match self.results.try_recv() {
                Ok(result) => out.extend(result?),
                Err(TryRecvError::Empty) => return Ok(out),
                Err(TryRecvError::Disconnected) => return Err(EncoderError::WorkerStopped),
            }
        }
    }
}

impl SegmentEncoder for BackgroundEncoder {
    fn is_ready_for_more_data(&self) -> bool {
        !self.finished && !self.busy.load(Ordering::Acquire) && self.requests.capacity() > 0
    }

    fn append(&mut self, frame: &Frame, pts: Duration) -> EncodeResult {
        if self.finished {
            return Err(EncoderError::Finished);
        }

        self.busy.store(true, Ordering::Release);
        match self.requests.try_send(EncodeRequest::Append(frame.clone(), pts)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::trace!("encoder slot taken, frame skipped");
            }
            Err(TrySendError::Closed(_)) => return Err(EncoderError::WorkerStopped),
        }
        self.collect()
    }

    /// Blocks until the worker has encoded its last frame and flushed.
    fn finish(&mut self) -> EncodeResult {
        if self.finished {
            return Err(EncoderError::Finished);
        }
        self.finished = true;

        self.requests
            .blocking_send(EncodeRequest::Finish)
            .map_err(|_| EncoderError::WorkerStopped)?;

        let mut out = Vec::new();
        while let Some(result) = self.results.blocking_recv() {
            out.extend(result?);
        }
        Ok(out)
    }
}

//! Capture and detection threads.
//!
//! The capture thread never waits on anyone: it pulls frames from the
//! source, offers each one to the chunker and to the detector. Encoding and
//! inference run on their own threads behind single-slot handoffs, so a busy
//! encoder or detector costs a skipped frame, never a stalled camera.

use crate::error::SessionError;
use crate::orchestrator::CaptureCommand;
use crate::runtime::SessionMessage;
use liveface_core::chunker::{ChunkerState, VideoChunker};
use liveface_core::detector::FaceDetector;
use liveface_core::frame::{Frame, FrameOrientation, FrameSource};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

pub(crate) struct CaptureLoop {
    pub source: Box<dyn FrameSource>,
    pub orientation: FrameOrientation,
    pub chunker: VideoChunker,
    pub commands: mpsc::UnboundedReceiver<CaptureCommand>,
    pub detector: mpsc::Sender<Frame>,
    pub messages: mpsc::UnboundedSender<SessionMessage>,
}

enum Flow {
    Continue,
    Stop,
}

impl CaptureLoop {
    pub fn spawn(self) -> Result<JoinHandle<()>, SessionError> {
        std::thread::Builder::new()
            .name("liveface-capture".into())
            .spawn(move || self.run())
            .map_err(|source| SessionError::Spawn {
                name: "capture",
                source,
            })
    }

    fn run(mut self) {
        tracing::info!("capture thread started");
        let mut frames = 0u64;
        let mut skipped_detection = 0u64;

        loop {
            if let Flow::Stop = self.drain_commands() {
                if self.chunker.state() == ChunkerState::AwaitingSingleFrame {
                    self.capture_still_frame();
                }
                break;
            }

            let frame = match self.source.next_frame() {
                Ok(Some(frame)) => self.orientation.normalize(frame),
                Ok(None) => {
                    tracing::info!(frames, "frame source ended");
                    break;
                }
                Err(e) => {
                    self.report(SessionError::from(e));
                    break;
                }
            };
            frames += 1;

            if let Err(e) = self.chunker.consume(&frame) {
                self.report(SessionError::from(e));
                break;
            }

            match self.detector.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => skipped_detection += 1,
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("detector thread gone");
                    break;
                }
            }
        }

        tracing::info!(
            frames,
            skipped_detection,
            dropped_encoding = self.chunker.dropped_frames(),
            "capture thread exiting"
        );
        let _ = self.messages.send(SessionMessage::CaptureEnded);
    }

    fn drain_commands(&mut self) -> Flow {
        loop {
            match self.commands.try_recv() {
                Ok(CaptureCommand::StartRecording) => {
                    self.chunker.start();
                }
                Ok(CaptureCommand::FinishRecording) => {
                    let messages = self.messages.clone();
                    let still = Box::new(move |image| {
                        let _ = messages.send(SessionMessage::StillFrame(image));
                    });
                    if let Err(e) = self.chunker.finish(still) {
                        self.report(SessionError::from(e));
                        return Flow::Stop;
                    }
                }
                Ok(CaptureCommand::Stop) => return Flow::Stop,
                Err(TryRecvError::Empty) => return Flow::Continue,
                Err(TryRecvError::Disconnected) => return Flow::Stop,
            }
        }
    }

    /// Pull one last frame for a still that was requested right before the stop.
    fn capture_still_frame(&mut self) {
        match self.source.next_frame() {
            Ok(Some(frame)) => {
                let frame = self.orientation.normalize(frame);
                if let Err(e) = self.chunker.consume(&frame) {
                    tracing::warn!(error = %e, "still frame not captured");
                }
            }
            Ok(None) => tracing::debug!("frame source ended before the still frame"),
            Err(e) => tracing::warn!(error = %e, "still frame not captured"),
        }
    }

    fn report(&self, error: SessionError) {
        tracing::error!(error = %error, "capture failed");
        let _ = self.messages.send(SessionMessage::CaptureFailed(error));
    }
}

/// Run `detector` on frames from `frames` until the capture side hangs up.
pub(crate) fn spawn_detector(
    mut detector: FaceDetector,
    mut frames: mpsc::Receiver<Frame>,
) -> Result<JoinHandle<()>, SessionError> {
    std::thread::Builder::new()
        .name("liveface-detector".into())
        .spawn(move || {
            tracing::info!("detector thread started");
            while let Some(frame) = frames.blocking_recv() {
                detector.detect_faces(&frame);
            }
            tracing::info!("detector thread exiting");
        })
        .map_err(|source| SessionError::Spawn {
            name: "detector",
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use liveface_core::chunker::{EncoderError, Segment, SegmentEncoder};
    use liveface_core::frame::FrameSourceError;
    use std::time::Duration;

    struct CountingSource {
        remaining: u32,
        fail_with_permission: bool,
    }

    impl FrameSource for CountingSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, FrameSourceError> {
            if self.fail_with_permission {
                return Err(FrameSourceError::PermissionDenied);
            }
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(Frame::new(
                RgbImage::new(4, 4),
                Duration::from_millis(u64::from(self.remaining)),
            )))
        }
    }

    struct NullEncoder;

    impl SegmentEncoder for NullEncoder {
        fn is_ready_for_more_data(&self) -> bool {
            true
        }
        fn append(&mut self, _: &Frame, _: Duration) -> Result<Vec<Segment>, EncoderError> {
            Ok(vec![])
        }
        fn finish(&mut self) -> Result<Vec<Segment>, EncoderError> {
            Ok(vec![])
        }
    }

    fn capture_loop(
        source: CountingSource,
    ) -> (
        CaptureLoop,
        mpsc::Receiver<Frame>,
        mpsc::UnboundedReceiver<SessionMessage>,
        mpsc::UnboundedSender<CaptureCommand>,
    ) {
        let (detector_tx, detector_rx) = mpsc::channel(1);
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let capture = CaptureLoop {
            source: Box::new(source),
            orientation: FrameOrientation::default(),
            chunker: VideoChunker::new(Box::new(NullEncoder), Box::new(|_| {})),
            commands: command_rx,
            detector: detector_tx,
            messages: message_tx,
        };
        (capture, detector_rx, message_rx, command_tx)
    }

    #[test]
    fn test_busy_detector_skips_frames() {
        let (capture, mut detector_rx, mut messages, _commands) = capture_loop(CountingSource {
            remaining: 5,
            fail_with_permission: false,
        });
        capture.run();

        // Single slot: only the first frame was accepted
        assert!(detector_rx.try_recv().is_ok());
        assert!(detector_rx.try_recv().is_err());
        assert!(matches!(
            messages.try_recv(),
            Ok(SessionMessage::CaptureEnded)
        ));
    }

    #[test]
    fn test_source_error_is_reported() {
        let (capture, _detector_rx, mut messages, _commands) = capture_loop(CountingSource {
            remaining: 5,
            fail_with_permission: true,
        });
        capture.run();
        assert!(matches!(
            messages.try_recv(),
            Ok(SessionMessage::CaptureFailed(SessionError::Capture(
                FrameSourceError::PermissionDenied
            )))
        ));
        assert!(matches!(
            messages.try_recv(),
            Ok(SessionMessage::CaptureEnded)
        ));
    }

    #[test]
    fn test_stop_command_ends_loop() {
        let (capture, mut detector_rx, mut messages, commands) = capture_loop(CountingSource {
            remaining: 100,
            fail_with_permission: false,
        });
        commands.send(CaptureCommand::Stop).unwrap();
        capture.run();
        assert!(detector_rx.try_recv().is_err());
        assert!(matches!(
            messages.try_recv(),
            Ok(SessionMessage::CaptureEnded)
        ));
    }

    #[test]
    fn test_finish_recording_delivers_still_frame() {
        let (capture, _detector_rx, mut messages, commands) = capture_loop(CountingSource {
            remaining: 3,
            fail_with_permission: false,
        });
        commands.send(CaptureCommand::StartRecording).unwrap();
        commands.send(CaptureCommand::FinishRecording).unwrap();
        capture.run();
        assert!(matches!(
            messages.try_recv(),
            Ok(SessionMessage::StillFrame(_))
        ));
    }

    #[test]
    fn test_still_frame_survives_stop_queued_behind_finish() {
        let (capture, _detector_rx, mut messages, commands) = capture_loop(CountingSource {
            remaining: 100,
            fail_with_permission: false,
        });
        commands.send(CaptureCommand::StartRecording).unwrap();
        commands.send(CaptureCommand::FinishRecording).unwrap();
        commands.send(CaptureCommand::Stop).unwrap();
        capture.run();

        let mut stills = 0;
        let mut ended = false;
        while let Ok(message) = messages.try_recv() {
            match message {
                SessionMessage::StillFrame(_) => stills += 1,
                SessionMessage::CaptureEnded => ended = true,
                _ => {}
            }
        }
        assert_eq!(stills, 1);
        assert!(ended);
    }

    #[test]
    fn test_stop_without_pending_still_reads_no_frame() {
        let (capture, _detector_rx, mut messages, commands) = capture_loop(CountingSource {
            remaining: 100,
            fail_with_permission: false,
        });
        commands.send(CaptureCommand::StartRecording).unwrap();
        commands.send(CaptureCommand::Stop).unwrap();
        capture.run();
        assert!(matches!(
            messages.try_recv(),
            Ok(SessionMessage::CaptureEnded)
        ));
        assert!(messages.try_recv().is_err());
    }
}

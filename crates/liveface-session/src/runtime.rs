//! Session runtime: spawns the capture and detector threads and the single
//! orchestration task that owns the state machine.

use crate::capture::{spawn_detector, CaptureLoop};
use crate::encoder::BackgroundEncoder;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::orchestrator::{OrchestratorLinks, PresentationEvent, SessionOrchestrator};
use image::RgbImage;
use liveface_core::chunker::{SegmentEncoder, VideoChunker, VideoSegment};
use liveface_core::clock::Clock;
use liveface_core::detector::{DetectionModel, FaceDetection, FaceDetector};
use liveface_core::events::{EventChannel, ServiceEvent, ServiceEventSink};
use liveface_core::frame::{Frame, FrameSource};
use liveface_core::state::LivenessState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use uuid::Uuid;

/// Messages into the orchestration task. Every producer sends and moves on.
#[derive(Debug)]
pub(crate) enum SessionMessage {
    Detection(FaceDetection),
    VideoSegment(VideoSegment),
    StillFrame(RgbImage),
    Service(ServiceEvent),
    CaptureFailed(SessionError),
    CaptureEnded,
    Cancel,
    Background,
}

/// External collaborators for one session.
pub struct SessionComponents {
    pub source: Box<dyn FrameSource>,
    pub model: Box<dyn DetectionModel>,
    /// Driven from its own thread; see [`BackgroundEncoder`].
    pub encoder: Box<dyn SegmentEncoder>,
    pub channel: Box<dyn EventChannel>,
    pub clock: Arc<dyn Clock>,
}

/// Handle to a running session.
pub struct SessionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<SessionMessage>,
    presentation: Option<mpsc::UnboundedReceiver<PresentationEvent>>,
    done: oneshot::Receiver<LivenessState>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// User cancelled. Ends the session with `UserCancelled`.
    pub fn cancel(&self) {
        let _ = self.tx.send(SessionMessage::Cancel);
    }

    /// Host application was backgrounded. Ends the session.
    pub fn background(&self) {
        let _ = self.tx.send(SessionMessage::Background);
    }

    /// Presentation notifications. Can be taken once.
    pub fn take_presentation(&mut self) -> Option<mpsc::UnboundedReceiver<PresentationEvent>> {
        self.presentation.take()
    }

    /// Wait for the session to reach a terminal state.
    pub async fn wait(self) -> Result<LivenessState, SessionError> {
        self.done.await.map_err(|_| SessionError::TaskClosed)
    }
}

/// Start a liveness session. Must be called from within a tokio runtime.
pub fn spawn_session(
    config: &SessionConfig,
    components: SessionComponents,
) -> Result<SessionHandle, SessionError> {
    let id = Uuid::new_v4();
    let span = tracing::info_span!("session", %id);
    let _entered = span.enter();

    let (tx, rx) = mpsc::unbounded_channel::<SessionMessage>();
    let (presentation_tx, presentation_rx) = mpsc::unbounded_channel();
    let (capture_tx, capture_rx) = mpsc::unbounded_channel();
    let (frame_tx, frame_rx) = mpsc::channel::<Frame>(1);
    let (done_tx, done_rx) = oneshot::channel();

    let detections = tx.clone();
    let detector = FaceDetector::new(
        components.model,
        config.detector_config(),
        Box::new(move |result| {
            let _ = detections.send(SessionMessage::Detection(result));
        }),
    );

    let segments = tx.clone();
    let chunker = VideoChunker::new(
        Box::new(BackgroundEncoder::spawn(components.encoder)?),
        Box::new(move |segment| {
            let _ = segments.send(SessionMessage::VideoSegment(segment));
        }),
    );

    let service = tx.clone();
    let orchestrator = SessionOrchestrator::new(
        config,
        OrchestratorLinks {
            channel: components.channel,
            inbound: ServiceEventSink::new(move |event| {
                let _ = service.send(SessionMessage::Service(event));
            }),
            presentation: presentation_tx,
            capture: capture_tx,
            clock: components.clock,
        },
    );

    spawn_detector(detector, frame_rx)?;
    CaptureLoop {
        source: components.source,
        orientation: config.orientation,
        chunker,
        commands: capture_rx,
        detector: frame_tx,
        messages: tx.clone(),
    }
    .spawn()?;

    tokio::spawn(
        run_orchestration(orchestrator, rx, done_tx, config.tick_interval).instrument(span.clone()),
    );
    tracing::info!("session started");

    Ok(SessionHandle {
        id,
        tx,
        presentation: Some(presentation_rx),
        done: done_rx,
    })
}

async fn run_orchestration(
    mut orchestrator: SessionOrchestrator,
    mut rx: mpsc::UnboundedReceiver<SessionMessage>,
    done: oneshot::Sender<LivenessState>,
    tick_interval: Duration,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    orchestrator.start();
    let mut capture_ended = false;

    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else {
                    break;
                };
                if matches!(message, SessionMessage::CaptureEnded) {
                    capture_ended = true;
                }
                dispatch(&mut orchestrator, message);
            }
            _ = ticker.tick() => orchestrator.tick(),
        }

        // Keep draining until capture has stopped so the still frame can land
        if orchestrator.is_terminal() && capture_ended {
            break;
        }
    }

    let state = orchestrator.state().clone();
    tracing::info!(
        state = ?state,
        final_sent = orchestrator.has_sent_final(),
        "orchestration finished"
    );
    let _ = done.send(state);
}

fn dispatch(orchestrator: &mut SessionOrchestrator, message: SessionMessage) {
    match message {
        SessionMessage::Detection(result) => orchestrator.handle_detection(result),
        SessionMessage::VideoSegment(segment) => orchestrator.handle_video_segment(segment),
        SessionMessage::StillFrame(image) => orchestrator.handle_still_frame(image),
        SessionMessage::Service(event) => orchestrator.handle_service_event(event),
        SessionMessage::CaptureFailed(error) => orchestrator.handle_failure(error),
        SessionMessage::CaptureEnded => orchestrator.handle_capture_ended(),
        SessionMessage::Cancel => orchestrator.cancel(),
        SessionMessage::Background => orchestrator.background(),
    }
}

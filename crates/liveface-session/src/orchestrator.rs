//! Session orchestrator: the single owner of a session's state machine.
//!
//! Detector results, video segments, service events and timer ticks all
//! arrive here, one at a time, from the orchestration task. Every outbound
//! side effect (client events, presentation notifications, capture commands)
//! leaves from here too. Once the state machine reaches a terminal state
//! every handler turns into a no-op.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::retry::RetryPolicy;
use image::RgbImage;
use liveface_core::challenge::{ChallengeConfig, FreshnessColor};
use liveface_core::chunker::{VideoChunkAssembler, VideoSegment};
use liveface_core::clock::{duration_ms, Clock};
use liveface_core::detector::FaceDetection;
use liveface_core::events::{
    ClientEvent, DisconnectReason, EventChannel, InitialFace, ServiceEvent, ServiceEventSink,
};
use liveface_core::freshness::{FreshnessSequence, FreshnessStep};
use liveface_core::geometry::{DetectedFace, Rect};
use liveface_core::instructor::{Instruction, OvalMatchInstructor};
use liveface_core::state::{FaceNotPreparedReason, LivenessError, LivenessState, LivenessStateMachine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Notifications for the presentation layer. Fire and forget.
#[derive(Debug, Clone)]
pub enum PresentationEvent {
    DrawTargetRegion(Rect),
    DisplayColor {
        color: FreshnessColor,
        duration: Duration,
    },
    DisplayStillFrame(RgbImage),
    Instruction {
        instruction: Instruction,
        percentage: f32,
    },
    StateChanged(LivenessState),
}

/// Commands for the capture thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureCommand {
    StartRecording,
    /// Finalize the video and extract one still frame.
    FinishRecording,
    Stop,
}

/// Everything the orchestrator talks to, resolved at construction.
pub struct OrchestratorLinks {
    pub channel: Box<dyn EventChannel>,
    /// Handed to the channel on open; routes service events back here.
    pub inbound: ServiceEventSink,
    pub presentation: mpsc::UnboundedSender<PresentationEvent>,
    pub capture: mpsc::UnboundedSender<CaptureCommand>,
    pub clock: Arc<dyn Clock>,
}

pub struct SessionOrchestrator {
    face_distance_threshold: f32,
    no_fit_timeout_ms: u64,
    recording_delay_ms: u64,

    machine: LivenessStateMachine,
    reported: LivenessState,
    instructor: OvalMatchInstructor,
    retry: RetryPolicy,
    assembler: VideoChunkAssembler,
    challenge: Option<ChallengeConfig>,
    freshness: Option<FreshnessSequence>,

    channel: Box<dyn EventChannel>,
    channel_open: bool,
    inbound: ServiceEventSink,
    presentation: mpsc::UnboundedSender<PresentationEvent>,
    capture: mpsc::UnboundedSender<CaptureCommand>,
    clock: Arc<dyn Clock>,

    waiting_since_ms: Option<u64>,
    no_fit_since_ms: Option<u64>,
    initial_face: Option<InitialFace>,
    match_start_ms: Option<u64>,
    match_end_ms: Option<u64>,
    final_sent: bool,
}

impl SessionOrchestrator {
    pub fn new(config: &SessionConfig, links: OrchestratorLinks) -> Self {
        let machine = LivenessStateMachine::new();
        let reported = machine.state().clone();
        Self {
            face_distance_threshold: config.face_distance_threshold,
            no_fit_timeout_ms: duration_ms(config.no_fit_timeout),
            recording_delay_ms: duration_ms(config.recording_delay),
            machine,
            reported,
            instructor: OvalMatchInstructor::with_hysteresis(config.hysteresis_frames),
            retry: RetryPolicy::new(config.stream_open_attempts),
            assembler: VideoChunkAssembler::new(),
            challenge: None,
            freshness: None,
            channel: links.channel,
            channel_open: false,
            inbound: links.inbound,
            presentation: links.presentation,
            capture: links.capture,
            clock: links.clock,
            waiting_since_ms: None,
            no_fit_since_ms: None,
            initial_face: None,
            match_start_ms: None,
            match_end_ms: None,
            final_sent: false,
        }
    }

    pub fn state(&self) -> &LivenessState {
        self.machine.state()
    }

    pub fn is_terminal(&self) -> bool {
        self.machine.is_terminal()
    }

    pub fn has_sent_final(&self) -> bool {
        self.final_sent
    }

    /// Begin the face-preparation check.
    pub fn start(&mut self) {
        self.machine.check_is_face_prepared();
        self.sync();
    }

    pub fn handle_detection(&mut self, detection: FaceDetection) {
        if self.is_terminal() {
            return;
        }
        match detection {
            FaceDetection::NoFace => self.handle_missing_face(FaceNotPreparedReason::NoFace),
            FaceDetection::MultipleFaces => {
                self.handle_missing_face(FaceNotPreparedReason::MultipleFaces)
            }
            FaceDetection::SingleFace(face) => self.handle_single_face(face),
        }
        self.sync();
    }

    fn handle_missing_face(&mut self, reason: FaceNotPreparedReason) {
        match self.machine.state() {
            LivenessState::PendingFacePreparedConfirmation { .. } => {
                self.machine.face_not_prepared(reason);
            }
            LivenessState::Recording {
                oval_displayed: true,
            }
            | LivenessState::AwaitingFaceInOvalMatch { .. } => {
                self.check_no_fit_timer(true);
            }
            LivenessState::DisplayingFreshness
                if reason == FaceNotPreparedReason::MultipleFaces =>
            {
                self.fail(LivenessError::InvalidFaceMovementDuringCountdown);
            }
            _ => {}
        }
    }

    fn handle_single_face(&mut self, face: DetectedFace) {
        let face = face.normalized();
        let face_box = face.landmark_bounding_box().clamped();

        match *self.machine.state() {
            LivenessState::PendingFacePreparedConfirmation { .. } => {
                let distance = face.distance();
                if distance <= self.face_distance_threshold {
                    tracing::info!(distance, "face prepared");
                    self.machine.wait_for_recording();
                    self.waiting_since_ms = Some(self.clock.now_ms());
                    self.open_stream();
                } else {
                    self.machine
                        .face_not_prepared(FaceNotPreparedReason::FaceTooClose);
                }
            }
            LivenessState::Recording {
                oval_displayed: false,
            } => {
                let Some(challenge) = &self.challenge else {
                    tracing::debug!("no session configuration yet, holding before oval");
                    return;
                };
                let target = challenge.target_region;
                self.machine.oval_displayed();
                self.present(PresentationEvent::DrawTargetRegion(target));
                self.send_initial_face(face_box);
            }
            LivenessState::Recording {
                oval_displayed: true,
            }
            | LivenessState::AwaitingFaceInOvalMatch { .. } => {
                self.match_face(&face_box);
            }
            _ => {}
        }
    }

    fn match_face(&mut self, face_box: &Rect) {
        let Some(challenge) = &self.challenge else {
            return;
        };
        let instruction =
            self.instructor
                .face_match_state(face_box, &challenge.target_region, challenge);
        let percentage = self.instructor.percentage();
        self.present(PresentationEvent::Instruction {
            instruction,
            percentage,
        });

        if instruction.is_match() {
            let now = self.clock.now_ms();
            self.machine.face_matched();
            self.no_fit_since_ms = None;
            self.match_start_ms = Some(now);
            if self.freshness.is_none() {
                tracing::info!(percentage, "face matched, arming freshness sequence");
                self.freshness = Some(FreshnessSequence::new(challenge.colors.clone()));
            }
        } else {
            self.machine.awaiting_face_match(instruction, percentage);
            self.check_no_fit_timer(true);
        }
    }

    /// Start the no-fit timer if `arm` and it is not running, then time out
    /// if it has been running for too long.
    fn check_no_fit_timer(&mut self, arm: bool) {
        let now = self.clock.now_ms();
        if arm && self.no_fit_since_ms.is_none() {
            self.no_fit_since_ms = Some(now);
        }
        let Some(since) = self.no_fit_since_ms else {
            return;
        };
        let elapsed = now.saturating_sub(since);
        if elapsed >= self.no_fit_timeout_ms {
            tracing::info!(elapsed_ms = elapsed, "face did not fit the target region in time");
            self.fail(LivenessError::TimedOut);
        }
    }

    fn send_initial_face(&mut self, face_box: Rect) {
        if self.initial_face.is_some() {
            return;
        }
        let now = self.clock.now_ms();
        let initial = InitialFace {
            bounding_box: face_box,
            timestamp_ms: now,
        };
        self.initial_face = Some(initial);
        self.send(ClientEvent::InitialFaceDetected {
            bounding_box: face_box,
            timestamp_ms: now,
        });
    }

    /// Forward a media segment as a video event, only while the video is live.
    pub fn handle_video_segment(&mut self, segment: VideoSegment) {
        if self.is_terminal() {
            return;
        }
        if self.initial_face.is_none() || self.final_sent {
            tracing::trace!(bytes = segment.current.len(), "discarding segment outside the video window");
            return;
        }
        let bytes = self
            .assembler
            .chunk(&segment.initialization, &segment.current);
        let timestamp_ms = self.clock.now_ms();
        self.send(ClientEvent::Video {
            bytes,
            timestamp_ms,
        });
        self.sync();
    }

    /// Still frame extracted after the video was finalized.
    pub fn handle_still_frame(&mut self, image: RgbImage) {
        if !self.final_sent {
            return;
        }
        self.present(PresentationEvent::DisplayStillFrame(image));
    }

    pub fn handle_service_event(&mut self, event: ServiceEvent) {
        if self.is_terminal() {
            return;
        }
        match event {
            ServiceEvent::SessionConfiguration { challenge } => {
                if self.challenge.is_some() {
                    tracing::warn!("ignoring repeated session configuration");
                } else if let Err(e) = challenge.validate() {
                    self.handle_failure(SessionError::from(e));
                } else {
                    tracing::info!(
                        target_region = ?challenge.target_region,
                        colors = challenge.colors.len(),
                        "session configuration received"
                    );
                    self.challenge = Some(challenge);
                }
            }
            ServiceEvent::Disconnect {
                reason: DisconnectReason::Graceful,
            } => {
                tracing::info!(final_sent = self.final_sent, "service closed the session");
                self.machine.complete();
            }
            ServiceEvent::Disconnect {
                reason: DisconnectReason::Unexpected,
            } => {
                self.fail(LivenessError::SocketClosed);
            }
        }
        self.sync();
    }

    /// Advance clock-driven work: the recording delay, the freshness
    /// sequence and the no-fit timeout.
    pub fn tick(&mut self) {
        if self.is_terminal() {
            return;
        }
        let now = self.clock.now_ms();

        match self.machine.state() {
            LivenessState::WaitForRecording => {
                let since = *self.waiting_since_ms.get_or_insert(now);
                if now.saturating_sub(since) >= self.recording_delay_ms
                    && self.machine.begin_recording()
                {
                    self.command(CaptureCommand::StartRecording);
                }
            }
            LivenessState::Recording {
                oval_displayed: true,
            }
            | LivenessState::AwaitingFaceInOvalMatch { .. } => {
                self.check_no_fit_timer(false);
            }
            LivenessState::FaceMatched => {
                if self.freshness.is_some() && self.machine.start_displaying_freshness() {
                    self.advance_freshness(now);
                }
            }
            LivenessState::DisplayingFreshness => self.advance_freshness(now),
            _ => {}
        }
        self.sync();
    }

    fn advance_freshness(&mut self, now: u64) {
        let Some(sequence) = self.freshness.as_mut() else {
            return;
        };
        match sequence.advance(now) {
            FreshnessStep::Idle => {}
            FreshnessStep::Display(change) => {
                tracing::debug!(sequence = change.sequence_number, color = ?change.color.rgb, "freshness color");
                self.present(PresentationEvent::DisplayColor {
                    color: change.color,
                    duration: change.color.duration(),
                });
                self.send(ClientEvent::Freshness {
                    color: change.color.rgb,
                    sequence_number: change.sequence_number,
                    timestamp_ms: change.started_at_ms,
                    previous_color: change.previous.rgb,
                });
            }
            FreshnessStep::Completed { finished_at_ms } => {
                self.match_end_ms = Some(finished_at_ms);
                self.machine.completed_displaying_freshness();
                self.send_final();
            }
        }
    }

    fn send_final(&mut self) {
        if self.final_sent || self.is_terminal() {
            return;
        }
        let (Some(challenge), Some(initial_face)) = (&self.challenge, self.initial_face) else {
            tracing::error!("final event without configuration or initial face");
            self.fail(LivenessError::Unknown);
            return;
        };
        let now = self.clock.now_ms();
        let event = ClientEvent::Final {
            target_face_box: challenge.target_region,
            initial_face,
            match_start_ms: self.match_start_ms.unwrap_or(now),
            match_end_ms: self.match_end_ms.unwrap_or(now),
            video_start_ms: initial_face.timestamp_ms,
            video_end_ms: now,
        };
        self.final_sent = true;
        self.send(event);
        self.send(ClientEvent::Video {
            bytes: Vec::new(),
            timestamp_ms: now,
        });
        if !self.is_terminal() {
            tracing::info!("final event sent");
            self.command(CaptureCommand::FinishRecording);
        }
    }

    /// User cancelled the session.
    pub fn cancel(&mut self) {
        tracing::info!("session cancelled by user");
        self.fail(LivenessError::UserCancelled);
        self.sync();
    }

    /// Host application moved to the background.
    pub fn background(&mut self) {
        tracing::info!("session backgrounded");
        self.fail(LivenessError::UserCancelled);
        self.sync();
    }

    pub fn handle_failure(&mut self, error: SessionError) {
        tracing::error!(error = %error, "session failure");
        self.fail(error.liveness_error());
        self.sync();
    }

    /// The capture thread stopped delivering frames.
    pub fn handle_capture_ended(&mut self) {
        if self.is_terminal() || self.final_sent {
            return;
        }
        tracing::warn!(state = ?self.machine.state(), "frame source ended mid-session");
        self.fail(LivenessError::FrameworkFailure);
        self.sync();
    }

    fn open_stream(&mut self) {
        let inbound = self.inbound.clone();
        let channel = &mut self.channel;
        match self.retry.run("open stream", || channel.open(inbound.clone())) {
            Ok(()) => {
                tracing::info!(attempts = self.retry.attempts(), "verification stream open");
                self.channel_open = true;
            }
            Err(_) => self.fail(LivenessError::CouldNotOpenStream),
        }
    }

    fn send(&mut self, event: ClientEvent) {
        if self.is_terminal() {
            return;
        }
        if !self.channel_open {
            tracing::error!(kind = event.kind(), "stream not open, cannot send");
            self.fail(LivenessError::SocketClosed);
            return;
        }
        let kind = event.kind();
        if let Err(e) = self.channel.send(event) {
            tracing::error!(kind, error = %e, "failed to send client event");
            self.fail(SessionError::from(e).liveness_error());
        }
    }

    fn fail(&mut self, error: LivenessError) {
        self.machine.unrecoverable_state_encountered(error);
    }

    fn present(&self, event: PresentationEvent) {
        let _ = self.presentation.send(event);
    }

    fn command(&self, command: CaptureCommand) {
        tracing::debug!(?command, "capture command");
        let _ = self.capture.send(command);
    }

    /// Publish state changes and tear down once terminal.
    fn sync(&mut self) {
        if *self.machine.state() == self.reported {
            return;
        }
        self.reported = self.machine.state().clone();
        self.present(PresentationEvent::StateChanged(self.reported.clone()));

        if self.reported.is_terminal() {
            tracing::info!(state = ?self.reported, "session ended");
            self.command(CaptureCommand::Stop);
            if self.channel_open {
                self.channel.close();
                self.channel_open = false;
            }
        }
    }
}

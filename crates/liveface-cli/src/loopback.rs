//! In-process stand-in for the verification service.
//!
//! Sends the challenge as soon as the stream opens, records every client
//! event, optionally writes the received video chunks to a file, and hangs
//! up gracefully once the end-of-stream marker arrives.

use liveface_core::challenge::ChallengeConfig;
use liveface_core::events::{
    ChannelError, ClientEvent, DisconnectReason, EventChannel, ServiceEvent, ServiceEventSink,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default, Clone, Serialize)]
pub struct LoopbackReport {
    pub events: BTreeMap<&'static str, usize>,
    pub video_bytes: usize,
    pub received_final: bool,
}

pub struct LoopbackService {
    challenge: ChallengeConfig,
    video_path: Option<PathBuf>,
    video: Option<BufWriter<File>>,
    inbound: Option<ServiceEventSink>,
    report: Arc<Mutex<LoopbackReport>>,
}

impl LoopbackService {
    pub fn new(challenge: ChallengeConfig, video_path: Option<PathBuf>) -> Self {
        Self {
            challenge,
            video_path,
            video: None,
            inbound: None,
            report: Arc::new(Mutex::new(LoopbackReport::default())),
        }
    }

    /// Shared view of what the service received so far.
    pub fn report(&self) -> Arc<Mutex<LoopbackReport>> {
        self.report.clone()
    }

    fn record(&self, event: &ClientEvent) {
        if let Ok(mut report) = self.report.lock() {
            *report.events.entry(event.kind()).or_default() += 1;
            match event {
                ClientEvent::Video { bytes, .. } => report.video_bytes += bytes.len(),
                ClientEvent::Final { .. } => report.received_final = true,
                _ => {}
            }
        }
    }
}

impl EventChannel for LoopbackService {
    fn open(&mut self, inbound: ServiceEventSink) -> Result<(), ChannelError> {
        if let Some(path) = &self.video_path {
            let file = File::create(path)
                .map_err(|e| ChannelError::Open(format!("{}: {e}", path.display())))?;
            self.video = Some(BufWriter::new(file));
        }
        tracing::info!("loopback service: stream open, sending challenge");
        inbound.deliver(ServiceEvent::SessionConfiguration {
            challenge: self.challenge.clone(),
        });
        self.inbound = Some(inbound);
        Ok(())
    }

    fn send(&mut self, event: ClientEvent) -> Result<(), ChannelError> {
        let Some(inbound) = self.inbound.clone() else {
            return Err(ChannelError::NotOpen);
        };
        self.record(&event);

        match &event {
            ClientEvent::Video { bytes, .. } if !bytes.is_empty() => {
                if let Some(video) = self.video.as_mut() {
                    video
                        .write_all(bytes)
                        .map_err(|e| ChannelError::Send(e.to_string()))?;
                }
            }
            ClientEvent::Video { .. } => {
                tracing::info!("loopback service: end of stream, hanging up");
                if let Some(video) = self.video.as_mut() {
                    video.flush().map_err(|e| ChannelError::Send(e.to_string()))?;
                }
                inbound.deliver(ServiceEvent::Disconnect {
                    reason: DisconnectReason::Graceful,
                });
            }
            other => {
                let json = serde_json::to_string(other).unwrap_or_default();
                tracing::info!(event = %json, "loopback service: received");
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut video) = self.video.take() {
            if let Err(e) = video.flush() {
                tracing::warn!(error = %e, "failed to flush video output");
            }
        }
        self.inbound = None;
    }
}

//! Events exchanged with the remote verification service, and the channel contract.
//!
//! The transport itself is opaque: the pipeline hands fully-formed
//! [`ClientEvent`]s to an [`EventChannel`] in the order they must arrive, and
//! receives [`ServiceEvent`]s through the [`ServiceEventSink`] it passes in
//! when the channel is opened.

use crate::challenge::{ChallengeConfig, Rgb};
use crate::geometry::Rect;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// First face seen once the target region was on screen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InitialFace {
    pub bounding_box: Rect,
    pub timestamp_ms: u64,
}

/// Outbound events. Every variant is timestamped when it is sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    InitialFaceDetected {
        bounding_box: Rect,
        timestamp_ms: u64,
    },
    /// A self-contained media chunk. An empty payload marks the end of the stream.
    Video {
        bytes: Vec<u8>,
        timestamp_ms: u64,
    },
    Freshness {
        color: Rgb,
        sequence_number: u32,
        timestamp_ms: u64,
        previous_color: Rgb,
    },
    Final {
        target_face_box: Rect,
        initial_face: InitialFace,
        match_start_ms: u64,
        match_end_ms: u64,
        video_start_ms: u64,
        video_end_ms: u64,
    },
}

impl ClientEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::InitialFaceDetected { .. } => "initial_face_detected",
            ClientEvent::Video { .. } => "video",
            ClientEvent::Freshness { .. } => "freshness",
            ClientEvent::Final { .. } => "final",
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, ClientEvent::Video { bytes, .. } if bytes.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Graceful,
    Unexpected,
}

/// Inbound events from the verification service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceEvent {
    SessionConfiguration { challenge: ChallengeConfig },
    Disconnect { reason: DisconnectReason },
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("failed to open stream: {0}")]
    Open(String),
    #[error("stream is not open")]
    NotOpen,
    #[error("send failed: {0}")]
    Send(String),
}

/// Receiving end for service events, handed to the channel when it opens.
#[derive(Clone)]
pub struct ServiceEventSink {
    deliver: Arc<dyn Fn(ServiceEvent) + Send + Sync>,
}

impl ServiceEventSink {
    pub fn new(deliver: impl Fn(ServiceEvent) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn deliver(&self, event: ServiceEvent) {
        (self.deliver)(event)
    }
}

impl fmt::Debug for ServiceEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServiceEventSink")
    }
}

/// Ordered, opaque event transport to the verification service.
pub trait EventChannel: Send {
    fn open(&mut self, inbound: ServiceEventSink) -> Result<(), ChannelError>;
    fn send(&mut self, event: ClientEvent) -> Result<(), ChannelError>;
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_end_of_stream_marker() {
        let empty = ClientEvent::Video {
            bytes: vec![],
            timestamp_ms: 1,
        };
        let chunk = ClientEvent::Video {
            bytes: vec![1, 2, 3],
            timestamp_ms: 1,
        };
        assert!(empty.is_end_of_stream());
        assert!(!chunk.is_end_of_stream());
        assert_eq!(chunk.kind(), "video");
    }

    #[test]
    fn test_service_event_json_shape() {
        let json = r#"{"type": "disconnect", "reason": "graceful"}"#;
        let event: ServiceEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            ServiceEvent::Disconnect {
                reason: DisconnectReason::Graceful
            }
        );
    }

    #[test]
    fn test_client_event_is_tagged() {
        let event = ClientEvent::Freshness {
            color: Rgb::new(255, 0, 0),
            sequence_number: 2,
            timestamp_ms: 10,
            previous_color: Rgb::new(0, 0, 0),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "freshness");
        assert_eq!(value["color"], serde_json::json!([255, 0, 0]));
    }

    #[test]
    fn test_sink_forwards_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sink = ServiceEventSink::new(move |e| seen_clone.lock().unwrap().push(e));
        sink.clone().deliver(ServiceEvent::Disconnect {
            reason: DisconnectReason::Unexpected,
        });
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}

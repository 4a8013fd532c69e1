//! Outbound event channel
//!
//! Every externally visible state change of the core is funneled through one [`EventSink`].
//! Whatever sits on the other end (UI, logger) owns the receiver; the core never waits on it.
//!
//! ```text
//! LinkSession ──┐
//! Liveness    ──┼──► EventSink ──[mpsc]──► consumer
//! TaktRun     ──┘
//! ```

use crate::error::ConnectFailure;
use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Named events with a fixed payload shape per name
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutboundEvent {
    Connected {
        broker: String,
    },
    ConnectionError {
        reason: ConnectFailure,
        detail: String,
    },
    ModelLoaded {
        source: String,
    },
    ModelMissing {
        detail: String,
    },
    TaktScreenDetected {
        at: DateTime<Local>,
    },
    TaktDetected {
        takt: u8,
        at: DateTime<Local>,
    },
    TaktScreenClosed {
        takt: u8,
    },
    DeviceDisconnected {
        device_id: String,
    },
    DeviceStatusChanged {
        device_id: String,
        connected: bool,
    },
    MessageSent {
        device_id: String,
        takt_count: u8,
    },
    MessageError {
        device_id: String,
        takt_count: u8,
        detail: String,
    },
    RuntimeError {
        detail: String,
    },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::Connected { .. } => "connected",
            OutboundEvent::ConnectionError { .. } => "connection_error",
            OutboundEvent::ModelLoaded { .. } => "model_loaded",
            OutboundEvent::ModelMissing { .. } => "model_missing",
            OutboundEvent::TaktScreenDetected { .. } => "takt_screen_detected",
            OutboundEvent::TaktDetected { .. } => "takt_detected",
            OutboundEvent::TaktScreenClosed { .. } => "takt_screen_closed",
            OutboundEvent::DeviceDisconnected { .. } => "device_disconnected",
            OutboundEvent::DeviceStatusChanged { .. } => "device_status_changed",
            OutboundEvent::MessageSent { .. } => "message_sent",
            OutboundEvent::MessageError { .. } => "message_error",
            OutboundEvent::RuntimeError { .. } => "runtime_error",
        }
    }
}

/// Non-blocking producer side of the outbound channel
///
/// Cheap to clone; every component holds its own copy. When the consumer falls behind the
/// event is dropped and logged rather than stalling the caller.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::Sender<OutboundEvent>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: OutboundEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event channel full, dropping {}", event.name());
            }
            Err(TrySendError::Closed(event)) => {
                debug!("No event consumer attached, dropping {}", event.name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_their_name_as_tag() {
        let event = OutboundEvent::MessageSent {
            device_id: "cost-2-2408".into(),
            takt_count: 2,
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], event.name());
        assert_eq!(json["device_id"], "cost-2-2408");
        assert_eq!(json["takt_count"], 2);
    }

    #[test]
    fn connection_error_reason_is_snake_case() {
        let event = OutboundEvent::ConnectionError {
            reason: ConnectFailure::BadCredentials,
            detail: "refused".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["reason"], "bad_credentials");
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit(OutboundEvent::RuntimeError { detail: "a".into() });
        sink.emit(OutboundEvent::RuntimeError { detail: "b".into() });

        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundEvent::RuntimeError { detail: "a".into() }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn emitting_without_consumer_is_silent() {
        let (sink, rx) = EventSink::channel(4);
        drop(rx);
        sink.emit(OutboundEvent::Connected {
            broker: "localhost:1883".into(),
        });
    }
}

//! Error taxonomy for the relay core
//!
//! Only [`LinkError::Connect`] and [`ClassifierError::ModelMissing`] end a run. Everything
//! else is absorbed where it happens and reported on the outbound event channel.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Why a broker session could not be established
///
/// Refusals are distinguished by the broker's CONNACK return code; the remaining variants
/// cover failures that never produced an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectFailure {
    /// No acknowledgement within the connect timeout
    Timeout,
    /// Broker does not speak the requested protocol level
    ProtocolMismatch,
    /// Client identifier rejected by the broker
    ClientIdRejected,
    /// Broker reachable but not accepting sessions
    ServerUnavailable,
    /// Username or password rejected
    BadCredentials,
    /// Credentials accepted but not allowed to connect
    Unauthorized,
    /// Network level failure (DNS, refused socket, TLS, ...)
    Unreachable,
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectFailure::Timeout => "timed out waiting for broker acknowledgement",
            ConnectFailure::ProtocolMismatch => "protocol version refused",
            ConnectFailure::ClientIdRejected => "client id rejected",
            ConnectFailure::ServerUnavailable => "server unavailable",
            ConnectFailure::BadCredentials => "bad username or password",
            ConnectFailure::Unauthorized => "not authorized",
            ConnectFailure::Unreachable => "broker unreachable",
        };
        f.write_str(text)
    }
}

/// Errors raised by the broker session
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Connection failed ({failure}): {detail}")]
    Connect {
        failure: ConnectFailure,
        detail: String,
    },

    #[error("Session is not connected")]
    NotConnected,

    #[error("Client rejected request: {0}")]
    Client(String),
}

impl LinkError {
    pub fn connect(failure: ConnectFailure, detail: impl Into<String>) -> Self {
        LinkError::Connect {
            failure,
            detail: detail.into(),
        }
    }
}

/// Recoverable command publishing failures
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Link session is not connected")]
    SessionDown,

    #[error("Device {0} is not registered")]
    UnknownDevice(String),

    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Broker rejected publish: {0}")]
    Rejected(#[from] LinkError),
}

/// Heartbeat payload could not be decoded
#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("Heartbeat is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Heartbeat is not a JSON object")]
    NotAnObject,
}

/// Errors reported by a [`Classifier`](crate::takt::classifier::Classifier)
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Detection model unavailable: {0}")]
    ModelMissing(String),

    #[error("Frame acquisition failed: {0}")]
    Capture(String),

    #[error("Label source closed")]
    SourceClosed,
}

/// Errors raised inside a single tick of the takt loop
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),
}

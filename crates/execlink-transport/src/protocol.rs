//! Wire protocol for client-engine communication.
//!
//! Outbound frames are `{event, data, timestamp}`; inbound frames are
//! `{event, data}` and are decoded here into [`ServerEvent`] so nothing past
//! the transport ever looks at an untyped map.

use chrono::{DateTime, Utc};
use execlink_core::{AgentId, AgentStatus, LogEntry, SessionId, SessionStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Close code the engine uses to say "authentication rejected, do not retry".
pub const AUTH_REJECTED_CLOSE_CODE: u16 = 4001;

/// Close code reported when the connection dropped without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Control message from client to engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Must be the first frame after the socket opens.
    Auth { token: String },
    SubscribeSession { session_id: SessionId },
    UnsubscribeSession { session_id: SessionId },
    StartExecution { session_id: SessionId },
    PauseExecution { session_id: SessionId },
    CancelExecution { session_id: SessionId },
    UserInput { session_id: SessionId, input: String },
}

impl ClientEvent {
    /// Wire name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::SubscribeSession { .. } => "subscribe_session",
            Self::UnsubscribeSession { .. } => "unsubscribe_session",
            Self::StartExecution { .. } => "start_execution",
            Self::PauseExecution { .. } => "pause_execution",
            Self::CancelExecution { .. } => "cancel_execution",
            Self::UserInput { .. } => "user_input",
        }
    }

    /// Encode as an outbound envelope stamped with `timestamp`.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self, timestamp: DateTime<Utc>) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("timestamp".to_string(), Value::String(timestamp.to_rfc3339()));
        }
        serde_json::to_string(&value)
    }
}

/// `execution_log` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub session_id: SessionId,
    pub log: LogEntry,
}

/// `execution_status` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub session_id: SessionId,
    pub status: SessionStatus,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub agent_status: Option<AgentStatus>,
}

/// `execution_screenshot` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotEvent {
    pub session_id: SessionId,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    /// Base64 image, optionally as a data URL.
    pub screenshot: String,
}

/// `execution_completed` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedEvent {
    pub session_id: SessionId,
    #[serde(default)]
    pub result: Value,
}

/// `execution_error` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionErrorEvent {
    pub session_id: SessionId,
    pub error: String,
}

/// Decoded inbound event.
///
/// The last three variants never come off the wire; the connection manager
/// raises them itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Log(LogEvent),
    Status(StatusEvent),
    Screenshot(ScreenshotEvent),
    Completed(CompletedEvent),
    ExecutionError(ExecutionErrorEvent),
    /// The transport opened and authenticated for connection epoch `epoch`.
    Connected { epoch: u64 },
    /// The transport closed.
    Disconnected { code: u16, reason: String },
    /// The transport could not be constructed.
    TransportError { message: String },
}

/// Key used to register handlers on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Log,
    Status,
    Screenshot,
    Completed,
    ExecutionError,
    Connected,
    Disconnected,
    TransportError,
}

impl ServerEvent {
    /// Bus key for this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Log(_) => EventKind::Log,
            Self::Status(_) => EventKind::Status,
            Self::Screenshot(_) => EventKind::Screenshot,
            Self::Completed(_) => EventKind::Completed,
            Self::ExecutionError(_) => EventKind::ExecutionError,
            Self::Connected { .. } => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::TransportError { .. } => EventKind::TransportError,
        }
    }

    /// Session the event belongs to, for session-scoped events.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Log(e) => Some(e.session_id.as_str()),
            Self::Status(e) => Some(e.session_id.as_str()),
            Self::Screenshot(e) => Some(e.session_id.as_str()),
            Self::Completed(e) => Some(e.session_id.as_str()),
            Self::ExecutionError(e) => Some(e.session_id.as_str()),
            Self::Connected { .. } | Self::Disconnected { .. } | Self::TransportError { .. } => {
                None
            }
        }
    }

    /// Decode an inbound text frame.
    ///
    /// # Errors
    /// Returns error for malformed JSON, unknown event names or payloads
    /// that do not match their event.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let envelope: InboundEnvelope = serde_json::from_str(text)?;
        let data = envelope.data;
        let event = match envelope.event.as_str() {
            "execution_log" => Self::Log(serde_json::from_value(data)?),
            "execution_status" => Self::Status(serde_json::from_value(data)?),
            "execution_screenshot" => Self::Screenshot(serde_json::from_value(data)?),
            "execution_completed" => Self::Completed(serde_json::from_value(data)?),
            "execution_error" => Self::ExecutionError(serde_json::from_value(data)?),
            _ => return Err(DecodeError::UnknownEvent(envelope.event)),
        };
        Ok(event)
    }
}

#[derive(Deserialize)]
struct InboundEnvelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Inbound decode error.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Unknown event: {0}")]
    UnknownEvent(String),
}

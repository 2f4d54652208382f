//! Error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SessionId;

/// Category of an error surfaced by the coordination layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The transport could not be constructed at all.
    Transport,
    /// The server refused authentication.
    AuthRejected,
    /// The connection dropped.
    Disconnected,
    /// The engine reported that a session failed.
    Execution,
    /// A local command request failed.
    Command,
    /// A local command was not legal from the current status.
    InvalidTransition,
    /// The pre-flight capability check failed.
    Incompatible,
}

/// An error kept as data for callers to inspect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct CoordError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CoordError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Execution directory error.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Directory not reachable: {0}")]
    Unreachable(String),
    #[error("Directory returned {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Failed to decode directory response: {0}")]
    Decode(String),
    #[error("Directory error: {0}")]
    Internal(String),
}

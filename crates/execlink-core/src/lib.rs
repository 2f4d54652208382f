//! Core abstractions for execution session coordination.
//!
//! This crate provides the fundamental building blocks:
//! - Session, agent and log types
//! - `Timeline` - Append-only log record with live listeners
//! - `ClientConfig` - Endpoints and reconnect policy
//! - `ExecutionDirectory` - Contract of the remote REST directory

pub mod config;
pub mod directory;
pub mod error;
pub mod timeline;
pub mod types;

pub use config::{ClientConfig, ReconnectConfig};
pub use directory::ExecutionDirectory;
pub use error::{CoordError, DirectoryError, ErrorKind};
pub use timeline::Timeline;
pub use types::{
    AgentId, AgentParticipation, AgentStatus, CompatibilityReport, CreateSessionRequest,
    LogEntry, LogKind, LogLevel, Session, SessionConfig, SessionId, SessionResult,
    SessionSnapshot, SessionStatus, SessionSummary,
};

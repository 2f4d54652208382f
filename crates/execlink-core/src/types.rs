//! Session, agent and log types shared by every layer.

use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Session identifier, opaque and assigned by the execution directory.
pub type SessionId = String;

/// Agent identifier.
pub type AgentId = String;

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session is created but not yet started.
    Pending,
    /// Session is currently running.
    Running,
    /// Session is paused and may be resumed.
    Paused,
    /// Session completed successfully.
    Completed,
    /// Session failed.
    Failed,
    /// Session was cancelled.
    Cancelled,
}

impl SessionStatus {
    /// Whether no further transition can leave this status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a session in this status counts as executing.
    #[must_use]
    pub const fn is_executing(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-agent status inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Pending,
    Running,
    /// Agent is blocked on a predecessor or on user input.
    Waiting,
    Paused,
    Completed,
    Failed,
    Cancelled,
    /// Agent was never run because the session ended first.
    Skipped,
}

/// One agent's participation in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentParticipation {
    pub agent_id: AgentId,
    pub name: String,
    /// Position of the agent in the run order.
    pub order: u32,
    #[serde(default)]
    pub status: AgentStatus,
}

/// Run configuration for a session.
///
/// Well-known knobs are typed; anything else the engine accepts is kept
/// in `extra` and passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl SessionConfig {
    /// Get a pass-through value by key.
    #[must_use]
    pub fn get_extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Set a pass-through value.
    pub fn set_extra(&mut self, key: impl Into<String>, value: Value) {
        self.extra.insert(key.into(), value);
    }
}

/// Outcome of a session; only present once the session is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionResult {
    /// Result reported by a failed run.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: None,
            output: None,
            error: Some(message.into()),
        }
    }
}

/// One logical run of one or more agents against a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub prompt: String,
    pub status: SessionStatus,
    /// Agents in run order.
    #[serde(default)]
    pub agents: Vec<AgentParticipation>,
    #[serde(default)]
    pub config: SessionConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SessionResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Look up an agent's participation record.
    pub fn agent_mut(&mut self, agent_id: &str) -> Option<&mut AgentParticipation> {
        self.agents.iter_mut().find(|a| a.agent_id == agent_id)
    }

    /// Sort agents by their run order.
    pub fn sort_agents(&mut self) {
        self.agents.sort_by_key(|a| a.order);
    }

    /// Summary row for this session.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            prompt: self.prompt.clone(),
            status: self.status,
            agent_count: self.agents.len(),
            created_at: self.created_at,
        }
    }
}

/// List row returned by the execution directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub prompt: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub agent_count: usize,
    pub created_at: DateTime<Utc>,
}

/// A session plus its full log history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: Session,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

/// Request body for creating a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub prompt: String,
    pub agent_ids: Vec<AgentId>,
    #[serde(default)]
    pub config: SessionConfig,
}

/// Result of the pre-flight capability check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    pub compatible: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl CompatibilityReport {
    /// A report with no issues.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            compatible: true,
            issues: Vec::new(),
        }
    }
}

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
}

/// What produced a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    #[default]
    System,
    Agent,
    Model,
    Action,
    User,
    Screenshot,
}

/// One timeline entry.
///
/// Ids are only unique within one connection epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default = "fresh_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub kind: LogKind,
    #[serde(default)]
    pub message: String,
    /// Inline screen capture (base64 encoded image).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    /// Arrival time on this client.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    /// Create an entry with a fresh local id.
    #[must_use]
    pub fn new(level: LogLevel, kind: LogKind, message: impl Into<String>) -> Self {
        Self {
            id: fresh_id(),
            agent_id: None,
            level,
            kind,
            message: message.into(),
            screenshot: None,
            timestamp: Utc::now(),
        }
    }

    /// Entry echoing input the local user sent.
    #[must_use]
    pub fn user(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, LogKind::User, message)
    }

    /// Screen-capture frame from an agent.
    #[must_use]
    pub fn screenshot(agent_id: Option<AgentId>, payload: String) -> Self {
        Self {
            agent_id,
            screenshot: Some(payload),
            ..Self::new(LogLevel::Info, LogKind::Screenshot, "screenshot")
        }
    }

    /// Decode the inline screen capture.
    #[must_use]
    pub fn decode_screenshot(&self) -> Option<Vec<u8>> {
        let payload = self.screenshot.as_deref()?;
        // Data URLs carry a "data:image/png;base64," prefix.
        let raw = payload.split_once(',').map_or(payload, |(_, data)| data);
        BASE64.decode(raw).ok()
    }
}

fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

//! In-memory execution directory.

use std::{
    collections::HashMap,
    sync::{
        RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;
use execlink_core::{
    AgentId, AgentParticipation, AgentStatus, CompatibilityReport, CreateSessionRequest,
    DirectoryError, ExecutionDirectory, LogEntry, Session, SessionId, SessionSnapshot,
    SessionStatus, SessionSummary,
};
use uuid::Uuid;

/// In-memory directory implementation.
///
/// Useful for development and tests. Nothing executes: commands only move
/// the stored status, and data is lost on drop.
pub struct MemoryDirectory {
    sessions: RwLock<HashMap<SessionId, Session>>,
    logs: RwLock<HashMap<SessionId, Vec<LogEntry>>>,
    agent_names: RwLock<HashMap<AgentId, String>>,
    incompatible: RwLock<HashMap<AgentId, String>>,
    offline: AtomicBool,
}

impl MemoryDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            logs: RwLock::new(HashMap::new()),
            agent_names: RwLock::new(HashMap::new()),
            incompatible: RwLock::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Register a display name for an agent.
    pub fn register_agent(&self, agent_id: impl Into<AgentId>, name: impl Into<String>) {
        if let Ok(mut names) = self.agent_names.write() {
            names.insert(agent_id.into(), name.into());
        }
    }

    /// Make the compatibility check flag `agent_id`.
    pub fn mark_incompatible(&self, agent_id: impl Into<AgentId>, reason: impl Into<String>) {
        if let Ok(mut incompatible) = self.incompatible.write() {
            incompatible.insert(agent_id.into(), reason.into());
        }
    }

    /// While offline every call fails as unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Store a session as-is, replacing any existing one with the same id.
    ///
    /// # Errors
    /// Returns error if a lock is poisoned.
    pub fn insert(&self, snapshot: SessionSnapshot) -> Result<(), DirectoryError> {
        let SessionSnapshot { session, logs } = snapshot;
        self.logs
            .write()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?
            .insert(session.id.clone(), logs);
        self.sessions
            .write()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?
            .insert(session.id.clone(), session);
        Ok(())
    }

    /// Append to a stored session's history.
    ///
    /// # Errors
    /// Returns error if the session does not exist.
    pub fn push_log(&self, id: &str, entry: LogEntry) -> Result<(), DirectoryError> {
        self.logs
            .write()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?
            .get_mut(id)
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?
            .push(entry);
        Ok(())
    }

    fn check_online(&self) -> Result<(), DirectoryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unreachable("memory directory is offline".into()));
        }
        Ok(())
    }

    fn update<F>(&self, id: &str, apply: F) -> Result<(), DirectoryError>
    where
        F: FnOnce(&mut Session) -> Result<(), DirectoryError>,
    {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?;

        let session = sessions
            .get_mut(id)
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?;

        apply(session)
    }

    fn transition(
        &self,
        id: &str,
        allowed: &[SessionStatus],
        to: SessionStatus,
    ) -> Result<(), DirectoryError> {
        self.check_online()?;
        self.update(id, |session| {
            if !allowed.contains(&session.status) {
                return Err(DirectoryError::Http {
                    status: 409,
                    message: format!("session is {}", session.status),
                });
            }
            session.status = to;
            let now = Utc::now();
            if to == SessionStatus::Running && session.started_at.is_none() {
                session.started_at = Some(now);
            }
            if to.is_terminal() {
                session.completed_at = Some(now);
            }
            Ok(())
        })
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionDirectory for MemoryDirectory {
    async fn create_session(&self, request: &CreateSessionRequest) -> Result<Session, DirectoryError> {
        self.check_online()?;

        let agents = {
            let names = self
                .agent_names
                .read()
                .map_err(|e| DirectoryError::Internal(e.to_string()))?;
            request
                .agent_ids
                .iter()
                .zip(0u32..)
                .map(|(agent_id, order)| AgentParticipation {
                    agent_id: agent_id.clone(),
                    name: names.get(agent_id).cloned().unwrap_or_else(|| agent_id.clone()),
                    order,
                    status: AgentStatus::Pending,
                })
                .collect()
        };

        let session = Session {
            id: Uuid::new_v4().to_string(),
            prompt: request.prompt.clone(),
            status: SessionStatus::Pending,
            agents,
            config: request.config.clone(),
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        self.insert(SessionSnapshot {
            session: session.clone(),
            logs: Vec::new(),
        })?;

        Ok(session)
    }

    async fn start(&self, id: &str) -> Result<(), DirectoryError> {
        self.transition(
            id,
            &[SessionStatus::Pending, SessionStatus::Paused],
            SessionStatus::Running,
        )
    }

    async fn pause(&self, id: &str) -> Result<(), DirectoryError> {
        self.transition(id, &[SessionStatus::Running], SessionStatus::Paused)
    }

    async fn cancel(&self, id: &str) -> Result<(), DirectoryError> {
        self.transition(
            id,
            &[SessionStatus::Running, SessionStatus::Paused],
            SessionStatus::Cancelled,
        )
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, DirectoryError> {
        self.check_online()?;

        let sessions = self
            .sessions
            .read()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?;

        let mut result: Vec<SessionSummary> = sessions.values().map(Session::summary).collect();

        // Sort by created_at descending
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(result)
    }

    async fn get_session(&self, id: &str) -> Result<SessionSnapshot, DirectoryError> {
        self.check_online()?;

        let session = self
            .sessions
            .read()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?
            .get(id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?;

        let logs = self
            .logs
            .read()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?
            .get(id)
            .cloned()
            .unwrap_or_default();

        Ok(SessionSnapshot { session, logs })
    }

    async fn delete_session(&self, id: &str) -> Result<(), DirectoryError> {
        self.check_online()?;

        self.sessions
            .write()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?
            .remove(id)
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?;

        self.logs
            .write()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?
            .remove(id);

        Ok(())
    }

    async fn check_compatibility(
        &self,
        agent_ids: &[AgentId],
    ) -> Result<CompatibilityReport, DirectoryError> {
        self.check_online()?;

        let incompatible = self
            .incompatible
            .read()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?;

        let issues: Vec<String> = agent_ids
            .iter()
            .filter_map(|id| incompatible.get(id).map(|reason| format!("{id}: {reason}")))
            .collect();

        Ok(CompatibilityReport {
            compatible: issues.is_empty(),
            issues,
        })
    }
}

//! Local cache of sessions, timelines and the last surfaced error.
//!
//! Everything the UI reads lives here. Mutations come from two places:
//! local commands issued through [`crate::SessionClient`] and remote events
//! routed by [`crate::SubscriptionController`].

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::Utc;
use execlink_core::{
    AgentId, AgentStatus, CoordError, ErrorKind, LogEntry, Session, SessionId, SessionResult,
    SessionSnapshot, SessionStatus, SessionSummary, Timeline,
};
use serde_json::Value;
use tracing::debug;

use crate::machine::{CommandTicket, Lifecycle, LocalCommand, PendingCommand, TransitionError};

/// Fully loaded session plus its live timeline.
struct Current {
    session: Session,
    timeline: Arc<Timeline>,
}

#[derive(Default)]
struct State {
    summaries: Vec<SessionSummary>,
    lifecycles: HashMap<SessionId, Lifecycle>,
    current: Option<Current>,
    selected_agents: Vec<AgentId>,
    error: Option<CoordError>,
}

impl State {
    fn lifecycle(&mut self, id: &str, fallback: SessionStatus) -> &mut Lifecycle {
        self.lifecycles
            .entry(id.to_string())
            .or_insert_with(|| Lifecycle::new(fallback))
    }

    fn known_status(&self, id: &str) -> Option<SessionStatus> {
        if let Some(lifecycle) = self.lifecycles.get(id) {
            return Some(lifecycle.status());
        }
        if let Some(current) = self.current.as_ref().filter(|c| c.session.id == id) {
            return Some(current.session.status);
        }
        self.summaries.iter().find(|s| s.id == id).map(|s| s.status)
    }

    fn current_mut(&mut self, id: &str) -> Option<&mut Current> {
        self.current.as_mut().filter(|c| c.session.id == id)
    }

    /// Copy the effective status of `id` into the summary row and the
    /// current session record.
    fn sync_status(&mut self, id: &str) {
        let Some(status) = self.lifecycles.get(id).map(Lifecycle::status) else {
            return;
        };
        if let Some(summary) = self.summaries.iter_mut().find(|s| s.id == id) {
            summary.status = status;
        }
        if let Some(current) = self.current_mut(id) {
            let session = &mut current.session;
            session.status = status;
            if status == SessionStatus::Running && session.started_at.is_none() {
                session.started_at = Some(Utc::now());
            }
            if status.is_terminal() && session.completed_at.is_none() {
                session.completed_at = Some(Utc::now());
            }
        }
    }
}

/// Client-side session cache.
#[derive(Default)]
pub struct SessionDirectory {
    state: Mutex<State>,
}

impl SessionDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- listing ----

    /// Replace the session list with a fresh directory listing.
    ///
    /// Listed statuses become the confirmed status; a command still in
    /// flight keeps its optimistic status.
    pub fn set_sessions(&self, summaries: Vec<SessionSummary>) {
        let mut state = self.lock();
        for summary in &summaries {
            state
                .lifecycle(&summary.id, summary.status)
                .refresh_confirmed(summary.status);
        }
        state.summaries = summaries;
        let ids: Vec<SessionId> = state.summaries.iter().map(|s| s.id.clone()).collect();
        for id in ids {
            state.sync_status(&id);
        }
    }

    /// Cached session list, newest first.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.lock().summaries.clone()
    }

    /// Sessions whose effective status is `Running`.
    #[must_use]
    pub fn running_sessions(&self) -> Vec<SessionSummary> {
        self.lock()
            .summaries
            .iter()
            .filter(|s| s.status == SessionStatus::Running)
            .cloned()
            .collect()
    }

    // ---- current session ----

    /// Record a freshly created session and make it current.
    pub fn insert_created(&self, session: Session, epoch: u64) -> Arc<Timeline> {
        let mut state = self.lock();
        state.summaries.retain(|s| s.id != session.id);
        state.summaries.insert(0, session.summary());
        state
            .lifecycles
            .insert(session.id.clone(), Lifecycle::new(session.status));

        let timeline = Arc::new(Timeline::new(session.id.clone(), epoch));
        state.current = Some(Current {
            session,
            timeline: Arc::clone(&timeline),
        });
        timeline
    }

    /// Make a snapshot the current session with a timeline seeded from its
    /// history. The snapshot status is authoritative.
    pub fn set_current(&self, snapshot: SessionSnapshot, epoch: u64) -> Arc<Timeline> {
        let SessionSnapshot { mut session, logs } = snapshot;
        session.sort_agents();

        let mut state = self.lock();
        state
            .lifecycle(&session.id, session.status)
            .apply_remote(session.status);
        match state.summaries.iter_mut().find(|s| s.id == session.id) {
            Some(summary) => *summary = session.summary(),
            None => state.summaries.insert(0, session.summary()),
        }

        let timeline = Arc::new(Timeline::from_snapshot(session.id.clone(), epoch, logs));
        state.current = Some(Current {
            session,
            timeline: Arc::clone(&timeline),
        });
        timeline
    }

    /// The current session record.
    #[must_use]
    pub fn current(&self) -> Option<Session> {
        self.lock().current.as_ref().map(|c| c.session.clone())
    }

    #[must_use]
    pub fn current_id(&self) -> Option<SessionId> {
        self.lock().current.as_ref().map(|c| c.session.id.clone())
    }

    /// Timeline of the current session.
    #[must_use]
    pub fn timeline(&self) -> Option<Arc<Timeline>> {
        self.lock().current.as_ref().map(|c| Arc::clone(&c.timeline))
    }

    /// Whether the current session is running or paused.
    #[must_use]
    pub fn is_executing(&self) -> bool {
        let state = self.lock();
        state.current.as_ref().is_some_and(|c| {
            state
                .lifecycles
                .get(&c.session.id)
                .map_or(c.session.status, Lifecycle::status)
                .is_executing()
        })
    }

    /// Forget a session everywhere. Returns whether it was current.
    pub fn remove(&self, id: &str) -> bool {
        let mut state = self.lock();
        state.summaries.retain(|s| s.id != id);
        state.lifecycles.remove(id);
        let was_current = state.current_mut(id).is_some();
        if was_current {
            state.current = None;
        }
        was_current
    }

    /// Drop everything except the agent selection.
    pub fn clear(&self) {
        let mut state = self.lock();
        let selected = std::mem::take(&mut state.selected_agents);
        *state = State {
            selected_agents: selected,
            ..State::default()
        };
    }

    // ---- lifecycle ----

    /// Effective status of a known session.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<SessionStatus> {
        self.lock().known_status(id)
    }

    /// Last confirmed status of a known session.
    #[must_use]
    pub fn confirmed_status(&self, id: &str) -> Option<SessionStatus> {
        self.lock().lifecycles.get(id).map(Lifecycle::confirmed)
    }

    /// Command awaiting confirmation for a session.
    #[must_use]
    pub fn pending_command(&self, id: &str) -> Option<PendingCommand> {
        self.lock().lifecycles.get(id).and_then(|l| l.pending().cloned())
    }

    /// Apply a local command optimistically.
    ///
    /// # Errors
    /// Returns error if the command is not legal from the effective status;
    /// the error is also recorded.
    pub fn begin_command(
        &self,
        id: &str,
        command: LocalCommand,
    ) -> Result<CommandTicket, TransitionError> {
        let mut state = self.lock();
        let from = state.known_status(id).unwrap_or(SessionStatus::Pending);
        match state.lifecycle(id, from).begin(command) {
            Ok(ticket) => {
                state.sync_status(id);
                Ok(ticket)
            }
            Err(err) => {
                state.error = Some(CoordError::new(ErrorKind::InvalidTransition, err.to_string()));
                Err(err)
            }
        }
    }

    pub fn command_accepted(&self, id: &str, ticket: CommandTicket) {
        if let Some(lifecycle) = self.lock().lifecycles.get_mut(id) {
            lifecycle.accepted(ticket);
        }
    }

    /// Record a failed command request. The optimistic status is kept.
    pub fn command_failed(&self, id: &str, ticket: CommandTicket, message: &str) {
        let mut state = self.lock();
        if let Some(lifecycle) = state.lifecycles.get_mut(id) {
            lifecycle.failed(ticket, message);
        }
        state.error = Some(CoordError::new(ErrorKind::Command, message));
    }

    /// Roll a failed command back to the last accepted or confirmed status.
    pub fn revert_failed_command(&self, id: &str) -> Option<SessionStatus> {
        let mut state = self.lock();
        let restored = state.lifecycles.get_mut(id)?.revert_failed()?;
        state.sync_status(id);
        Some(restored)
    }

    // ---- remote events ----

    /// Append a log entry to the current session's timeline, stamped with
    /// its arrival time.
    pub fn append_log(&self, id: &str, mut entry: LogEntry) {
        entry.timestamp = Utc::now();
        let timeline = {
            let mut state = self.lock();
            let Some(current) = state.current_mut(id) else {
                debug!(session_id = %id, "dropping log for a session that is not loaded");
                return;
            };
            Arc::clone(&current.timeline)
        };
        timeline.push(entry);
    }

    /// Append a screen capture to the current session's timeline.
    pub fn append_screenshot(&self, id: &str, agent_id: Option<AgentId>, payload: String) {
        self.append_log(id, LogEntry::screenshot(agent_id, payload));
    }

    /// Apply an authoritative status, optionally for one agent only.
    pub fn apply_status(
        &self,
        id: &str,
        status: SessionStatus,
        agent: Option<(AgentId, AgentStatus)>,
    ) {
        let mut state = self.lock();
        if let Some((agent_id, agent_status)) = agent {
            if let Some(participant) = state
                .current_mut(id)
                .and_then(|c| c.session.agent_mut(&agent_id))
            {
                participant.status = agent_status;
            }
        }
        state.lifecycle(id, status).apply_remote(status);
        state.sync_status(id);
    }

    /// Mark a session completed with the engine's result.
    pub fn complete(&self, id: &str, result: Value) {
        let result = serde_json::from_value::<SessionResult>(result.clone()).unwrap_or(
            SessionResult {
                success: true,
                summary: None,
                output: Some(result),
                error: None,
            },
        );

        let mut state = self.lock();
        state
            .lifecycle(id, SessionStatus::Completed)
            .apply_remote(SessionStatus::Completed);
        if let Some(current) = state.current_mut(id) {
            current.session.result = Some(result);
        }
        state.sync_status(id);
    }

    /// Mark a session failed with the engine's error and surface it.
    pub fn fail(&self, id: &str, message: &str) {
        let mut state = self.lock();
        state
            .lifecycle(id, SessionStatus::Failed)
            .apply_remote(SessionStatus::Failed);
        if let Some(current) = state.current_mut(id) {
            current.session.result = Some(SessionResult::failure(message));
        }
        state.sync_status(id);
        state.error = Some(CoordError::new(ErrorKind::Execution, message));
    }

    // ---- agent selection ----

    /// Replace the agent selection used for new sessions.
    pub fn select_agents(&self, agents: Vec<AgentId>) {
        self.lock().selected_agents = agents;
    }

    /// Add or remove one agent. Returns whether it is now selected.
    pub fn toggle_agent(&self, agent_id: &str) -> bool {
        let mut state = self.lock();
        if let Some(pos) = state.selected_agents.iter().position(|a| a == agent_id) {
            state.selected_agents.remove(pos);
            false
        } else {
            state.selected_agents.push(agent_id.to_string());
            true
        }
    }

    #[must_use]
    pub fn selected_agents(&self) -> Vec<AgentId> {
        self.lock().selected_agents.clone()
    }

    // ---- errors ----

    /// Last surfaced error.
    #[must_use]
    pub fn error(&self) -> Option<CoordError> {
        self.lock().error.clone()
    }

    pub fn set_error(&self, error: CoordError) {
        self.lock().error = Some(error);
    }

    pub fn clear_error(&self) {
        self.lock().error = None;
    }
}

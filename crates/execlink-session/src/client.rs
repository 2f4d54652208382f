//! Application context: one transport, one directory, one local cache.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use execlink_core::{
    AgentId, CoordError, CreateSessionRequest, DirectoryError, ErrorKind, ExecutionDirectory,
    LogEntry, Session, SessionConfig, SessionId, SessionStatus, SessionSummary, Timeline,
};
use execlink_transport::{
    AUTH_REJECTED_CLOSE_CODE, ClientEvent, ConnectionManager, EventKind, ServerEvent, Unsubscribe,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    directory::SessionDirectory,
    machine::{LocalCommand, TransitionError},
    subscription::SubscriptionController,
};

/// Close code of a close the client asked for.
const NORMAL_CLOSE_CODE: u16 = 1000;

/// Session client error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("Agents cannot run together: {}", .0.join("; "))]
    Incompatible(Vec<String>),
    #[error("No agents selected")]
    NoAgentsSelected,
}

struct Inner {
    transport: Arc<ConnectionManager>,
    remote: Arc<dyn ExecutionDirectory>,
    directory: Arc<SessionDirectory>,
    subscriptions: SubscriptionController,
    listeners: Mutex<Vec<Unsubscribe>>,
}

/// Coordinates sessions between the UI, the directory and the engine.
///
/// Cheap to clone; all clones share the same connection and cache.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<Inner>,
}

impl SessionClient {
    /// Create a client over an existing transport and directory.
    #[must_use]
    pub fn new(transport: Arc<ConnectionManager>, remote: Arc<dyn ExecutionDirectory>) -> Self {
        let directory = Arc::new(SessionDirectory::new());
        let subscriptions =
            SubscriptionController::new(Arc::clone(&transport), Arc::clone(&directory));
        Self {
            inner: Arc::new(Inner {
                transport,
                remote,
                directory,
                subscriptions,
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a client that talks to the configured WebSocket and REST
    /// endpoints, authenticating both with `token`.
    #[cfg(feature = "http")]
    #[must_use]
    pub fn from_config(config: &execlink_core::ClientConfig, token: &str) -> Self {
        let transport = ConnectionManager::websocket(config.ws_url.clone(), &config.reconnect);
        let remote = crate::remote::HttpDirectory::new(&config.api_url).with_token(token);
        Self::new(transport, Arc::new(remote))
    }

    // ---- lifecycle ----

    /// Connect with `token` and reattach to a running session, if any.
    ///
    /// Returns the reattached session.
    ///
    /// # Errors
    /// Returns error if the session list cannot be fetched.
    pub async fn init(&self, token: impl Into<String>) -> Result<Option<SessionId>, ClientError> {
        self.watch_connection();
        self.inner.transport.connect(token);
        self.reattach().await
    }

    /// Unsubscribe, disconnect and forget all cached sessions.
    pub fn shutdown(&self) {
        if let Some(id) = self.inner.subscriptions.active_session() {
            self.inner.subscriptions.unsubscribe_from_session(&id);
        }
        self.inner.transport.disconnect();
        let listeners: Vec<Unsubscribe> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for listener in listeners {
            listener.unsubscribe();
        }
        self.inner.directory.clear();
        info!("Session client shut down");
    }

    /// Attach to the single running session, if there is exactly one.
    ///
    /// # Errors
    /// Returns error if the list or the snapshot cannot be fetched.
    pub async fn reattach(&self) -> Result<Option<SessionId>, ClientError> {
        let running: Vec<SessionSummary> = self
            .fetch_sessions()
            .await?
            .into_iter()
            .filter(|s| s.status == SessionStatus::Running)
            .collect();

        match running.as_slice() {
            [] => {
                debug!("No running session to reattach to");
                Ok(None)
            }
            [only] => {
                let id = only.id.clone();
                self.load_session(&id).await?;
                info!(session_id = %id, "Reattached to running session");
                Ok(Some(id))
            }
            many => {
                warn!("{} sessions are running, not reattaching", many.len());
                Ok(None)
            }
        }
    }

    fn watch_connection(&self) {
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !listeners.is_empty() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        listeners.push(self.inner.transport.on(EventKind::Connected, move |event| {
            if let ServerEvent::Connected { epoch } = *event {
                on_connected(&weak, epoch);
            }
        }));

        let directory = Arc::clone(&self.inner.directory);
        listeners.push(self.inner.transport.on(EventKind::Disconnected, move |event| {
            if let ServerEvent::Disconnected { code, reason } = event {
                match *code {
                    NORMAL_CLOSE_CODE => {}
                    AUTH_REJECTED_CLOSE_CODE => directory.set_error(CoordError::new(
                        ErrorKind::AuthRejected,
                        format!("authentication rejected: {reason}"),
                    )),
                    code => directory.set_error(CoordError::new(
                        ErrorKind::Disconnected,
                        format!("connection closed ({code}): {reason}"),
                    )),
                }
            }
        }));

        let directory = Arc::clone(&self.inner.directory);
        listeners.push(self.inner.transport.on(EventKind::TransportError, move |event| {
            if let ServerEvent::TransportError { message } = event {
                directory.set_error(CoordError::new(ErrorKind::Transport, message.clone()));
            }
        }));
    }

    /// Refetch the subscribed session after a reconnect and start a fresh
    /// timeline from the snapshot.
    async fn resync(&self, epoch: u64) {
        let Some(id) = self.inner.subscriptions.active_session() else {
            return;
        };
        match self.inner.remote.get_session(&id).await {
            Ok(snapshot) => {
                if self.inner.subscriptions.active_session().as_deref() != Some(id.as_str()) {
                    debug!(session_id = %id, "Subscription changed during resync, discarding snapshot");
                    return;
                }
                self.inner.directory.set_current(snapshot, epoch);
                self.inner.subscriptions.subscribe_to_session(&id);
                info!(session_id = %id, epoch, "Resynchronized session after reconnect");
            }
            Err(e) => {
                warn!(session_id = %id, "Resync after reconnect failed: {e}");
                self.inner.directory.set_error(CoordError::new(
                    ErrorKind::Disconnected,
                    format!("resync failed: {e}"),
                ));
            }
        }
    }

    // ---- directory ----

    /// Refresh the cached session list.
    ///
    /// # Errors
    /// Returns error if the directory request fails.
    pub async fn fetch_sessions(&self) -> Result<Vec<SessionSummary>, ClientError> {
        let sessions = self
            .inner
            .remote
            .list_sessions()
            .await
            .map_err(|e| self.record(e))?;
        self.inner.directory.set_sessions(sessions);
        Ok(self.inner.directory.sessions())
    }

    /// Load a session's snapshot, make it current and subscribe to it.
    ///
    /// # Errors
    /// Returns error if the snapshot cannot be fetched.
    pub async fn load_session(&self, id: &str) -> Result<Session, ClientError> {
        let snapshot = self
            .inner
            .remote
            .get_session(id)
            .await
            .map_err(|e| self.record(e))?;
        let session = snapshot.session.clone();
        self.inner
            .directory
            .set_current(snapshot, self.inner.transport.epoch());
        self.inner.subscriptions.subscribe_to_session(id);
        Ok(session)
    }

    /// Create a session running the selected agents and make it current.
    ///
    /// # Errors
    /// Returns error if no agent is selected or the directory request fails.
    pub async fn create_session(
        &self,
        prompt: impl Into<String>,
        config: SessionConfig,
    ) -> Result<Session, ClientError> {
        let agent_ids = self.inner.directory.selected_agents();
        if agent_ids.is_empty() {
            return Err(ClientError::NoAgentsSelected);
        }
        let request = CreateSessionRequest {
            prompt: prompt.into(),
            agent_ids,
            config,
        };
        let session = self
            .inner
            .remote
            .create_session(&request)
            .await
            .map_err(|e| self.record(e))?;

        self.inner
            .directory
            .insert_created(session.clone(), self.inner.transport.epoch());
        self.inner.subscriptions.subscribe_to_session(&session.id);
        info!(session_id = %session.id, "Created session");
        Ok(session)
    }

    /// Delete a session, dropping it from the cache once confirmed.
    ///
    /// # Errors
    /// Returns error if the directory request fails.
    pub async fn delete_session(&self, id: &str) -> Result<(), ClientError> {
        self.inner
            .remote
            .delete_session(id)
            .await
            .map_err(|e| self.record(e))?;
        self.inner.subscriptions.unsubscribe_from_session(id);
        self.inner.directory.remove(id);
        Ok(())
    }

    // ---- commands ----

    /// Start or resume a session after checking its agents can run.
    ///
    /// # Errors
    /// Returns error if the transition is illegal, the agents are
    /// incompatible or a request fails.
    pub async fn start(&self, id: &str) -> Result<(), ClientError> {
        self.check_transition(id, LocalCommand::Start)?;
        self.ensure_loaded(id).await?;

        let agent_ids: Vec<AgentId> = self
            .inner
            .directory
            .current()
            .map(|s| s.agents.into_iter().map(|a| a.agent_id).collect())
            .unwrap_or_default();
        let report = self
            .inner
            .remote
            .check_compatibility(&agent_ids)
            .await
            .map_err(|e| self.record(e))?;
        if !report.compatible {
            warn!(session_id = id, "Not starting, agents are incompatible");
            self.inner.directory.set_error(CoordError::new(
                ErrorKind::Incompatible,
                report.issues.join("; "),
            ));
            return Err(ClientError::Incompatible(report.issues));
        }

        self.run_command(id, LocalCommand::Start).await
    }

    /// Pause a running session.
    ///
    /// # Errors
    /// Returns error if the transition is illegal or the request fails.
    pub async fn pause(&self, id: &str) -> Result<(), ClientError> {
        self.check_transition(id, LocalCommand::Pause)?;
        self.ensure_loaded(id).await?;
        self.run_command(id, LocalCommand::Pause).await
    }

    /// Cancel a running or paused session.
    ///
    /// # Errors
    /// Returns error if the transition is illegal or the request fails.
    pub async fn cancel(&self, id: &str) -> Result<(), ClientError> {
        self.check_transition(id, LocalCommand::Cancel)?;
        self.ensure_loaded(id).await?;
        self.run_command(id, LocalCommand::Cancel).await
    }

    /// Send user input to a session and echo it into the timeline.
    ///
    /// Input the transport could not send is not echoed; a `Disconnected`
    /// error is recorded instead. Returns whether the input was sent.
    pub fn send_user_input(&self, id: &str, input: impl Into<String>) -> bool {
        let input = input.into();
        let sent = self.inner.transport.send(&ClientEvent::UserInput {
            session_id: id.to_string(),
            input: input.clone(),
        });
        if sent {
            self.inner.directory.append_log(id, LogEntry::user(input));
        } else {
            warn!(session_id = id, "User input not sent: transport is {}", self.inner.transport.state());
            self.inner.directory.set_error(CoordError::new(
                ErrorKind::Disconnected,
                "input not sent: not connected to the engine",
            ));
        }
        sent
    }

    /// Drop a failed command and show the confirmed status again.
    pub fn revert_failed_command(&self, id: &str) -> Option<SessionStatus> {
        self.inner.directory.revert_failed_command(id)
    }

    fn check_transition(&self, id: &str, command: LocalCommand) -> Result<(), ClientError> {
        match self.inner.directory.status(id) {
            Some(from) if !command.allowed_from(from) => {
                let err = TransitionError { command, from };
                warn!(session_id = id, "Rejected command: {err}");
                self.inner.directory.set_error(CoordError::new(
                    ErrorKind::InvalidTransition,
                    err.to_string(),
                ));
                Err(err.into())
            }
            _ => Ok(()),
        }
    }

    async fn ensure_loaded(&self, id: &str) -> Result<(), ClientError> {
        if self.inner.directory.current_id().as_deref() != Some(id) {
            self.load_session(id).await?;
        } else if self.inner.subscriptions.active_session().as_deref() != Some(id) {
            self.inner.subscriptions.subscribe_to_session(id);
        }
        Ok(())
    }

    async fn run_command(&self, id: &str, command: LocalCommand) -> Result<(), ClientError> {
        let ticket = self.inner.directory.begin_command(id, command)?;

        let result = match command {
            LocalCommand::Start => self.inner.remote.start(id).await,
            LocalCommand::Pause => self.inner.remote.pause(id).await,
            LocalCommand::Cancel => self.inner.remote.cancel(id).await,
        };

        match result {
            Ok(()) => {
                self.inner.directory.command_accepted(id, ticket);
                self.inner.transport.send(&control_message(command, id));
                info!(session_id = id, "{command} accepted");
                Ok(())
            }
            Err(e) => {
                warn!(session_id = id, "{command} failed: {e}");
                self.inner
                    .directory
                    .command_failed(id, ticket, &format!("{command} failed: {e}"));
                Err(e.into())
            }
        }
    }

    // ---- agent selection and errors ----

    pub fn select_agents(&self, agents: Vec<AgentId>) {
        self.inner.directory.select_agents(agents);
    }

    /// Returns whether the agent is now selected.
    pub fn toggle_agent(&self, agent_id: &str) -> bool {
        self.inner.directory.toggle_agent(agent_id)
    }

    #[must_use]
    pub fn error(&self) -> Option<CoordError> {
        self.inner.directory.error()
    }

    pub fn clear_error(&self) {
        self.inner.directory.clear_error();
    }

    fn record(&self, err: DirectoryError) -> ClientError {
        warn!("Directory request failed: {err}");
        self.inner
            .directory
            .set_error(CoordError::new(ErrorKind::Command, err.to_string()));
        err.into()
    }

    // ---- accessors ----

    /// Whether the current session is running or paused.
    #[must_use]
    pub fn is_executing(&self) -> bool {
        self.inner.directory.is_executing()
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.inner.directory.sessions()
    }

    #[must_use]
    pub fn current_session(&self) -> Option<Session> {
        self.inner.directory.current()
    }

    /// Timeline of the current session.
    #[must_use]
    pub fn timeline(&self) -> Option<Arc<Timeline>> {
        self.inner.directory.timeline()
    }

    #[must_use]
    pub fn directory(&self) -> &SessionDirectory {
        &self.inner.directory
    }

    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionController {
        &self.inner.subscriptions
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<ConnectionManager> {
        &self.inner.transport
    }
}

fn on_connected(weak: &Weak<Inner>, epoch: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let client = SessionClient { inner };
    if epoch > 1 {
        tokio::spawn(async move { client.resync(epoch).await });
    } else if let Some(id) = client.inner.subscriptions.active_session() {
        // Subscribed before the socket opened; the first request was dropped.
        client.inner.subscriptions.subscribe_to_session(&id);
    }
}

fn control_message(command: LocalCommand, id: &str) -> ClientEvent {
    let session_id = id.to_string();
    match command {
        LocalCommand::Start => ClientEvent::StartExecution { session_id },
        LocalCommand::Pause => ClientEvent::PauseExecution { session_id },
        LocalCommand::Cancel => ClientEvent::CancelExecution { session_id },
    }
}

//! Connection manager: one persistent, authenticated, self-healing socket.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use execlink_core::ReconnectConfig;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    backoff::ReconnectPolicy,
    bus::{EventBus, Unsubscribe},
    protocol::{
        ABNORMAL_CLOSE_CODE, AUTH_REJECTED_CLOSE_CODE, ClientEvent, EventKind, ServerEvent,
    },
    socket::{ConnectError, Connector, Incoming, Outgoing, SocketHandle, WsConnector},
};

/// Close code used when the client closes the socket itself.
const CLIENT_CLOSE_CODE: u16 = 1000;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
        })
    }
}

struct Inner {
    token: Option<String>,
    retry_count: u32,
    epoch: u64,
    /// Bumped for every dial and every explicit close. Callbacks from an
    /// older link are stale and ignored.
    link: u64,
    outgoing: Option<mpsc::UnboundedSender<Outgoing>>,
    reconnect_timer: Option<JoinHandle<()>>,
    auth_rejected: bool,
}

/// Owns the single transport connection.
///
/// All connection state (retry counter, socket handle, token) is private to
/// this type; other components only connect, disconnect, send and listen.
pub struct ConnectionManager {
    url: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    bus: EventBus,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
    me: Weak<Self>,
}

impl ConnectionManager {
    /// Create a manager using a custom connector.
    ///
    /// `url` must not carry credentials; the token travels in the `auth`
    /// frame.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        reconnect: &ReconnectConfig,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Closed);
        let url = url.into();
        Arc::new_cyclic(|me| Self {
            url,
            connector,
            policy: ReconnectPolicy::from_config(reconnect),
            bus: EventBus::new(),
            state,
            inner: Mutex::new(Inner {
                token: None,
                retry_count: 0,
                epoch: 0,
                link: 0,
                outgoing: None,
                reconnect_timer: None,
                auth_rejected: false,
            }),
            me: me.clone(),
        })
    }

    /// Create a manager that dials a real WebSocket.
    #[must_use]
    pub fn websocket(url: impl Into<String>, reconnect: &ReconnectConfig) -> Arc<Self> {
        Self::new(url, reconnect, Arc::new(WsConnector))
    }

    /// Open the connection and authenticate with `token`.
    ///
    /// Idempotent: does nothing while already connecting or open. Must be
    /// called inside a tokio runtime.
    pub fn connect(&self, token: impl Into<String>) {
        let mut inner = self.lock();
        let state = self.state();
        if state != ConnectionState::Closed {
            tracing::debug!("connect ignored, transport already {state}");
            return;
        }
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }
        inner.token = Some(token.into());
        inner.retry_count = 0;
        inner.auth_rejected = false;
        self.dial(&mut inner);
    }

    /// Close the connection and suppress automatic reconnection.
    ///
    /// Call on logout so a pending retry cannot revive a signed-out user.
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        inner.retry_count = self.policy.max_attempts();
        inner.token = None;
        inner.link += 1;
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(outgoing) = inner.outgoing.take() {
            let _ = outgoing.send(Outgoing::Close);
        }
        let was = self.state.send_replace(ConnectionState::Closed);
        drop(inner);

        if was != ConnectionState::Closed {
            tracing::info!("Transport disconnected by client");
            self.bus.publish(&ServerEvent::Disconnected {
                code: CLIENT_CLOSE_CODE,
                reason: "client disconnect".to_string(),
            });
        }
    }

    /// Send a control message. Dropped unless the connection is open.
    ///
    /// Returns whether the message was queued on the open socket.
    pub fn send(&self, event: &ClientEvent) -> bool {
        let inner = self.lock();
        let Some(outgoing) = inner
            .outgoing
            .as_ref()
            .filter(|_| self.state() == ConnectionState::Open)
        else {
            tracing::debug!("Dropping {} while transport is {}", event.name(), self.state());
            return false;
        };
        match event.encode(Utc::now()) {
            Ok(json) => outgoing.send(Outgoing::Text(json)).is_ok(),
            Err(e) => {
                tracing::error!("Failed to serialize {}: {e}", event.name());
                false
            }
        }
    }

    /// Register a handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Unsubscribe
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.bus.on(kind, handler)
    }

    /// Event bus carrying decoded inbound and synthetic events.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Retries scheduled since the last successful open.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.lock().retry_count
    }

    /// Number of successful opens so far.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Whether the last close was the server refusing authentication.
    #[must_use]
    pub fn is_auth_rejected(&self) -> bool {
        self.lock().auth_rejected
    }

    /// Whether a reconnect timer is waiting to fire.
    #[must_use]
    pub fn has_pending_reconnect(&self) -> bool {
        self.lock()
            .reconnect_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dial(&self, inner: &mut Inner) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        inner.link += 1;
        let link = inner.link;
        self.state.send_replace(ConnectionState::Connecting);
        tracing::debug!(link, "Dialing {}", self.url);

        tokio::spawn(async move {
            let result = me.connector.open(&me.url).await;
            me.on_dial_result(link, result);
        });
    }

    fn on_dial_result(self: &Arc<Self>, link: u64, result: Result<SocketHandle, ConnectError>) {
        let mut inner = self.lock();
        if inner.link != link || self.state() != ConnectionState::Connecting {
            // Superseded by disconnect() while dialing.
            if let Ok(handle) = result {
                let _ = handle.outgoing.send(Outgoing::Close);
            }
            return;
        }

        match result {
            Ok(handle) => {
                let SocketHandle { outgoing, incoming } = handle;
                if let Some(token) = inner.token.clone() {
                    match (ClientEvent::Auth { token }).encode(Utc::now()) {
                        Ok(json) => {
                            let _ = outgoing.send(Outgoing::Text(json));
                        }
                        Err(e) => tracing::error!("Failed to serialize auth: {e}"),
                    }
                }
                inner.retry_count = 0;
                inner.epoch += 1;
                let epoch = inner.epoch;
                inner.outgoing = Some(outgoing);
                self.state.send_replace(ConnectionState::Open);
                tokio::spawn(Arc::clone(self).read_loop(link, incoming));
                drop(inner);

                tracing::info!(epoch, "Transport open");
                self.bus.publish(&ServerEvent::Connected { epoch });
            }
            Err(ConnectError::Construction(message)) => {
                self.state.send_replace(ConnectionState::Closed);
                drop(inner);

                tracing::error!("Failed to construct transport: {message}");
                self.bus.publish(&ServerEvent::TransportError { message });
            }
            Err(ConnectError::Unreachable(reason)) => {
                drop(inner);
                self.on_close(link, ABNORMAL_CLOSE_CODE, reason);
            }
        }
    }

    async fn read_loop(self: Arc<Self>, link: u64, mut incoming: mpsc::UnboundedReceiver<Incoming>) {
        while let Some(frame) = incoming.recv().await {
            match frame {
                Incoming::Text(text) => {
                    let event = match ServerEvent::decode(&text) {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::warn!("Dropping inbound frame: {e}");
                            continue;
                        }
                    };
                    // Checked right before dispatch so a disconnect that
                    // landed while decoding drops the frame.
                    if !self.is_current(link) {
                        break;
                    }
                    self.bus.publish(&event);
                }
                Incoming::Closed { code, reason } => {
                    self.on_close(link, code, reason);
                    return;
                }
            }
        }
        self.on_close(link, ABNORMAL_CLOSE_CODE, "connection lost".to_string());
    }

    fn is_current(&self, link: u64) -> bool {
        let inner = self.lock();
        inner.link == link && self.state() == ConnectionState::Open
    }

    fn on_close(&self, link: u64, code: u16, reason: String) {
        let mut inner = self.lock();
        if inner.link != link || self.state() == ConnectionState::Closed {
            return;
        }
        inner.outgoing = None;
        self.state.send_replace(ConnectionState::Closed);

        if code == AUTH_REJECTED_CLOSE_CODE {
            inner.auth_rejected = true;
            tracing::warn!("Engine rejected authentication, not reconnecting");
        } else if let Some(delay) = self.policy.delay_for(inner.retry_count) {
            let attempt = inner.retry_count;
            inner.retry_count += 1;
            tracing::info!(code, attempt, "Transport closed, reconnecting in {delay:?}");
            let me = self.me.clone();
            inner.reconnect_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(me) = me.upgrade() {
                    me.retry();
                }
            }));
        } else {
            tracing::warn!(code, "Transport closed, reconnect attempts exhausted");
        }
        drop(inner);

        self.bus.publish(&ServerEvent::Disconnected { code, reason });
    }

    fn retry(&self) {
        let mut inner = self.lock();
        // Dropping the handle detaches it; this task is finishing anyway.
        inner.reconnect_timer = None;
        if self.state() != ConnectionState::Closed || inner.token.is_none() {
            return;
        }
        self.dial(&mut inner);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }
    }
}

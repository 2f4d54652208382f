//! Routing of one session's events into the local cache.
//!
//! At most one session is subscribed at a time. Switching sessions disposes
//! the previous handlers before registering new ones, and every handler
//! carries the generation it was registered under so a late event for the
//! old session cannot slip through.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use execlink_core::SessionId;
use execlink_transport::{ClientEvent, ConnectionManager, EventKind, ServerEvent, Unsubscribe};
use tracing::{debug, trace};

use crate::directory::SessionDirectory;

/// Event kinds routed for a subscribed session.
const SESSION_EVENTS: [EventKind; 5] = [
    EventKind::Log,
    EventKind::Status,
    EventKind::Screenshot,
    EventKind::Completed,
    EventKind::ExecutionError,
];

struct Active {
    session_id: SessionId,
    generation: u64,
    handlers: Vec<Unsubscribe>,
}

impl Active {
    fn dispose(self) {
        for handler in self.handlers {
            handler.unsubscribe();
        }
    }
}

#[derive(Default)]
struct State {
    generation: u64,
    active: Option<Active>,
}

impl State {
    fn is_live(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.generation == generation)
    }
}

/// Keeps exactly one session's event handlers registered.
pub struct SubscriptionController {
    transport: Arc<ConnectionManager>,
    directory: Arc<SessionDirectory>,
    state: Arc<Mutex<State>>,
}

impl SubscriptionController {
    #[must_use]
    pub fn new(transport: Arc<ConnectionManager>, directory: Arc<SessionDirectory>) -> Self {
        Self {
            transport,
            directory,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Route events of `session_id` into the cache, replacing any previous
    /// subscription. Returns the new generation.
    pub fn subscribe_to_session(&self, session_id: &str) -> u64 {
        let mut state = self.lock();
        if let Some(previous) = state.active.take() {
            if previous.session_id != session_id {
                self.transport.send(&ClientEvent::UnsubscribeSession {
                    session_id: previous.session_id.clone(),
                });
            }
            previous.dispose();
        }

        state.generation += 1;
        let generation = state.generation;

        self.transport.send(&ClientEvent::SubscribeSession {
            session_id: session_id.to_string(),
        });

        let handlers = SESSION_EVENTS
            .iter()
            .map(|&kind| self.register(kind, session_id, generation))
            .collect();
        state.active = Some(Active {
            session_id: session_id.to_string(),
            generation,
            handlers,
        });

        debug!(session_id, generation, "subscribed to session");
        generation
    }

    /// Stop routing events of `session_id`.
    ///
    /// Returns `false` without doing anything if that session is not the
    /// active subscription.
    pub fn unsubscribe_from_session(&self, session_id: &str) -> bool {
        let mut state = self.lock();
        if !state
            .active
            .as_ref()
            .is_some_and(|a| a.session_id == session_id)
        {
            debug!(session_id, "unsubscribe for a session that is not subscribed");
            return false;
        }
        if let Some(active) = state.active.take() {
            active.dispose();
        }
        self.transport.send(&ClientEvent::UnsubscribeSession {
            session_id: session_id.to_string(),
        });
        debug!(session_id, "unsubscribed from session");
        true
    }

    /// Currently subscribed session.
    #[must_use]
    pub fn active_session(&self) -> Option<SessionId> {
        self.lock().active.as_ref().map(|a| a.session_id.clone())
    }

    /// Generation of the latest subscription; 0 before the first one.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    fn register(&self, kind: EventKind, session_id: &str, generation: u64) -> Unsubscribe {
        let state = Arc::clone(&self.state);
        let directory = Arc::clone(&self.directory);
        let session_id = session_id.to_string();

        self.transport.on(kind, move |event| {
            // Held while routing so a concurrent switch waits for this event.
            let guard = lock(&state);
            if !guard.is_live(generation) {
                trace!(generation, "dropping event from a stale subscription");
                return;
            }
            if event.session_id() != Some(session_id.as_str()) {
                trace!(session_id = %session_id, "dropping event for another session");
                return;
            }
            route(&directory, event);
        })
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn route(directory: &SessionDirectory, event: &ServerEvent) {
    match event {
        ServerEvent::Log(e) => directory.append_log(&e.session_id, e.log.clone()),
        ServerEvent::Status(e) => {
            let agent = e.agent_id.clone().zip(e.agent_status);
            directory.apply_status(&e.session_id, e.status, agent);
        }
        ServerEvent::Screenshot(e) => {
            directory.append_screenshot(&e.session_id, e.agent_id.clone(), e.screenshot.clone());
        }
        ServerEvent::Completed(e) => directory.complete(&e.session_id, e.result.clone()),
        ServerEvent::ExecutionError(e) => directory.fail(&e.session_id, &e.error),
        ServerEvent::Connected { .. }
        | ServerEvent::Disconnected { .. }
        | ServerEvent::TransportError { .. } => {}
    }
}

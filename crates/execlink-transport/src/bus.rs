//! Publish/subscribe registry for decoded inbound events.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use crate::protocol::{EventKind, ServerEvent};

/// Event callback.
pub type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<(u64, Handler)>>,
    wildcard: Vec<(u64, Handler)>,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Kind(EventKind, u64),
    Wildcard(u64),
}

/// Event bus keyed by [`EventKind`] plus a wildcard channel.
///
/// Handlers for one kind run in registration order; there is no ordering
/// between kinds. Wildcard handlers run after the kind's own handlers.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Unsubscribe
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let id = registry.next_id();
        registry
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        self.handle(Slot::Kind(kind, id))
    }

    /// Register a handler that receives every event.
    pub fn on_any<F>(&self, handler: F) -> Unsubscribe
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let id = registry.next_id();
        registry.wildcard.push((id, Arc::new(handler)));
        self.handle(Slot::Wildcard(id))
    }

    /// Dispatch an event to its handlers and to the wildcard channel.
    ///
    /// Handlers run outside the registry lock, so they may register or
    /// unsubscribe without deadlocking.
    pub fn publish(&self, event: &ServerEvent) {
        let handlers: Vec<Handler> = {
            let registry = self.lock();
            registry
                .by_kind
                .get(&event.kind())
                .into_iter()
                .flatten()
                .chain(registry.wildcard.iter())
                .map(|(_, h)| Arc::clone(h))
                .collect()
        };
        for handler in handlers {
            handler(event);
        }
    }

    /// Number of handlers registered for a kind.
    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.lock().by_kind.get(&kind).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, slot: Slot) -> Unsubscribe {
        Unsubscribe {
            registry: Arc::downgrade(&self.registry),
            slot,
        }
    }
}

/// Removes one handler from the bus.
///
/// Dropping this without calling [`Unsubscribe::unsubscribe`] leaves the
/// handler registered.
#[must_use = "dropping the handle keeps the handler registered"]
pub struct Unsubscribe {
    registry: Weak<Mutex<Registry>>,
    slot: Slot,
}

impl Unsubscribe {
    /// Remove the handler. A no-op if the bus is gone.
    pub fn unsubscribe(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
        match self.slot {
            Slot::Kind(kind, id) => {
                if let Some(handlers) = registry.by_kind.get_mut(&kind) {
                    handlers.retain(|(h, _)| *h != id);
                }
            }
            Slot::Wildcard(id) => registry.wildcard.retain(|(h, _)| *h != id),
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe").field("slot", &self.slot).finish()
    }
}

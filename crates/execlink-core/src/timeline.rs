//! Append-only per-session log timeline with live listeners.

use std::sync::{PoisonError, RwLock};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::types::{LogEntry, LogKind, SessionId};

/// Capacity of the live broadcast channel. Slow listeners lag, history is kept.
const LIVE_CAPACITY: usize = 1024;

/// Default limit on screen-capture payload bytes kept in history (64 MB).
pub const SCREENSHOT_HISTORY_BYTES: usize = 64 * 1024 * 1024;

struct Inner {
    entries: Vec<LogEntry>,
    latest_screenshot: Option<LogEntry>,
    screenshot_bytes: usize,
    screenshot_budget: usize,
    /// Entries before this index carry no screenshot payload.
    trimmed_until: usize,
}

impl Inner {
    /// Drop the payloads of the oldest captures until the budget holds.
    /// The newest entry always keeps its payload.
    fn trim_screenshots(&mut self) {
        let newest = self.entries.len().saturating_sub(1);
        while self.screenshot_bytes > self.screenshot_budget && self.trimmed_until < newest {
            if let Some(payload) = self.entries[self.trimmed_until].screenshot.take() {
                self.screenshot_bytes = self.screenshot_bytes.saturating_sub(payload.len());
            }
            self.trimmed_until += 1;
        }
    }
}

/// Ordered log record of one session within one connection epoch.
///
/// Entries are never removed or reordered once inserted. Past the screenshot
/// budget the oldest captures lose their payload but keep their place. A
/// reconnect starts a new timeline seeded from a snapshot instead of
/// patching this one.
pub struct Timeline {
    session_id: SessionId,
    epoch: u64,
    inner: RwLock<Inner>,
    sender: broadcast::Sender<LogEntry>,
}

impl Timeline {
    /// Create an empty timeline.
    #[must_use]
    pub fn new(session_id: impl Into<SessionId>, epoch: u64) -> Self {
        Self::from_snapshot(session_id, epoch, Vec::new())
    }

    /// Create a timeline seeded with history fetched from the directory.
    #[must_use]
    pub fn from_snapshot(session_id: impl Into<SessionId>, epoch: u64, entries: Vec<LogEntry>) -> Self {
        let (sender, _) = broadcast::channel(LIVE_CAPACITY);
        let latest_screenshot = entries.iter().rev().find(|e| is_screenshot(e)).cloned();
        let screenshot_bytes = entries.iter().map(payload_bytes).sum();
        let mut inner = Inner {
            entries,
            latest_screenshot,
            screenshot_bytes,
            screenshot_budget: SCREENSHOT_HISTORY_BYTES,
            trimmed_until: 0,
        };
        inner.trim_screenshots();
        Self {
            session_id: session_id.into(),
            epoch,
            inner: RwLock::new(inner),
            sender,
        }
    }

    /// Limit the screenshot payload bytes kept in history.
    #[must_use]
    pub fn with_screenshot_budget(self, bytes: usize) -> Self {
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            inner.screenshot_budget = bytes;
            inner.trim_screenshots();
        }
        self
    }

    /// Screenshot payload bytes currently held in history.
    #[must_use]
    pub fn screenshot_bytes(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .screenshot_bytes
    }

    /// Session this timeline belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Connection epoch the live part of this timeline was received on.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Append an entry and notify live listeners.
    pub fn push(&self, entry: LogEntry) {
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            if is_screenshot(&entry) {
                inner.latest_screenshot = Some(entry.clone());
            }
            inner.screenshot_bytes = inner.screenshot_bytes.saturating_add(payload_bytes(&entry));
            inner.entries.push(entry.clone());
            inner.trim_screenshots();
        }
        let _ = self.sender.send(entry); // live listeners
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    /// Whether the timeline has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all entries in insertion order.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }

    /// Most recent screen capture, if any.
    #[must_use]
    pub fn latest_screenshot(&self) -> Option<LogEntry> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .latest_screenshot
            .clone()
    }

    /// Get a receiver for live appends.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<LogEntry> {
        self.sender.subscribe()
    }

    /// Stream that yields history first, then live appends.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, LogEntry> {
        // Subscribe under the read lock so no append falls between the two.
        let (history, rx) = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            (inner.entries.clone(), self.sender.subscribe())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}

fn is_screenshot(entry: &LogEntry) -> bool {
    entry.kind == LogKind::Screenshot || entry.screenshot.is_some()
}

fn payload_bytes(entry: &LogEntry) -> usize {
    entry.screenshot.as_ref().map_or(0, String::len)
}

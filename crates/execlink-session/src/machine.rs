//! Session lifecycle state machine.
//!
//! ```text
//! Pending ──start──▶ Running ──pause──▶ Paused
//!                      │  ▲───start(resume)──┘
//!                      │                     │
//!                      └──cancel──▶ Cancelled ◀──cancel
//! Running ──(remote only)──▶ Completed | Failed
//! ```
//!
//! Local commands flip the status optimistically and record a pending
//! command. Remote events are authoritative: they set the confirmed status
//! and clear whatever was pending.

use execlink_core::SessionStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Command a user can issue against a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalCommand {
    /// Start, or resume from `Paused`.
    Start,
    Pause,
    Cancel,
}

impl LocalCommand {
    /// Status the command optimistically moves to.
    #[must_use]
    pub const fn target(self) -> SessionStatus {
        match self {
            Self::Start => SessionStatus::Running,
            Self::Pause => SessionStatus::Paused,
            Self::Cancel => SessionStatus::Cancelled,
        }
    }

    /// Whether the command is legal from `from`.
    #[must_use]
    pub const fn allowed_from(self, from: SessionStatus) -> bool {
        matches!(
            (self, from),
            (Self::Start, SessionStatus::Pending | SessionStatus::Paused)
                | (Self::Pause, SessionStatus::Running)
                | (Self::Cancel, SessionStatus::Running | SessionStatus::Paused)
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for LocalCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected local command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {command} a session that is {from}")]
pub struct TransitionError {
    pub command: LocalCommand,
    pub from: SessionStatus,
}

/// Identifies one issued command so late replies can be matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandTicket(u64);

/// Where the request behind a pending command stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    InFlight,
    /// The directory accepted the request; waiting for the engine.
    Accepted,
    /// The request failed. The optimistic status is kept until reverted.
    Failed(String),
}

/// A command applied locally but not yet confirmed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub ticket: CommandTicket,
    pub command: LocalCommand,
    pub optimistic: SessionStatus,
    pub outcome: CommandOutcome,
}

/// Confirmed status plus at most one pending command.
///
/// A command the directory accepted moves the baseline that a later failed
/// command reverts to, even before the engine confirms it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    confirmed: SessionStatus,
    accepted: Option<SessionStatus>,
    pending: Option<PendingCommand>,
    next_ticket: u64,
}

impl Lifecycle {
    #[must_use]
    pub const fn new(confirmed: SessionStatus) -> Self {
        Self {
            confirmed,
            accepted: None,
            pending: None,
            next_ticket: 0,
        }
    }

    /// Effective status: the optimistic one while a command is pending.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.pending
            .as_ref()
            .map_or_else(|| self.baseline(), |p| p.optimistic)
    }

    /// Status a failed command falls back to: the target of the last
    /// accepted command, or the confirmed status.
    #[must_use]
    pub fn baseline(&self) -> SessionStatus {
        self.accepted.unwrap_or(self.confirmed)
    }

    /// Last status the engine or directory confirmed.
    #[must_use]
    pub const fn confirmed(&self) -> SessionStatus {
        self.confirmed
    }

    #[must_use]
    pub const fn pending(&self) -> Option<&PendingCommand> {
        self.pending.as_ref()
    }

    #[must_use]
    pub fn is_executing(&self) -> bool {
        self.status().is_executing()
    }

    /// Apply a local command optimistically.
    ///
    /// # Errors
    /// Returns error if the command is not legal from the effective status.
    pub fn begin(&mut self, command: LocalCommand) -> Result<CommandTicket, TransitionError> {
        let from = self.status();
        if !command.allowed_from(from) {
            return Err(TransitionError { command, from });
        }
        self.next_ticket += 1;
        let ticket = CommandTicket(self.next_ticket);
        self.pending = Some(PendingCommand {
            ticket,
            command,
            optimistic: command.target(),
            outcome: CommandOutcome::InFlight,
        });
        Ok(ticket)
    }

    /// Record that the directory accepted the command.
    pub fn accepted(&mut self, ticket: CommandTicket) {
        if let Some(pending) = self.pending.as_mut().filter(|p| p.ticket == ticket) {
            pending.outcome = CommandOutcome::Accepted;
            self.accepted = Some(pending.command.target());
        }
    }

    /// Record that the request failed. The optimistic status stays.
    pub fn failed(&mut self, ticket: CommandTicket, message: impl Into<String>) {
        if let Some(pending) = self.pending.as_mut().filter(|p| p.ticket == ticket) {
            pending.outcome = CommandOutcome::Failed(message.into());
        }
    }

    /// Drop a failed command and fall back to the baseline status.
    ///
    /// Returns the restored status, or `None` if nothing failed.
    pub fn revert_failed(&mut self) -> Option<SessionStatus> {
        if matches!(
            self.pending,
            Some(PendingCommand {
                outcome: CommandOutcome::Failed(_),
                ..
            })
        ) {
            self.pending = None;
            return Some(self.baseline());
        }
        None
    }

    /// Apply an authoritative status from the engine.
    pub fn apply_remote(&mut self, status: SessionStatus) {
        self.confirmed = status;
        self.accepted = None;
        self.pending = None;
    }

    /// Record a status read from a directory listing.
    ///
    /// Unlike [`Lifecycle::apply_remote`] this keeps an in-flight or
    /// accepted command, since a listing may predate it.
    pub fn refresh_confirmed(&mut self, status: SessionStatus) {
        self.confirmed = status;
    }
}

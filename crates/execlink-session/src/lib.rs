//! Session coordination on top of the execution transport.
//!
//! Provides:
//! - `SessionClient` - Application context with init/shutdown and commands
//! - `SubscriptionController` - One session's events routed at a time
//! - `SessionDirectory` - Local cache read by the UI
//! - Lifecycle state machine with pending vs confirmed status
//! - Directory implementations (memory, HTTP)

pub mod client;
pub mod directory;
pub mod machine;
pub mod remote;
pub mod subscription;

pub use client::{ClientError, SessionClient};
pub use directory::SessionDirectory;
pub use machine::{CommandOutcome, Lifecycle, LocalCommand, PendingCommand, TransitionError};
pub use subscription::SubscriptionController;

//! Transport layer to the execution engine.
//!
//! Provides:
//! - Wire protocol (typed control messages and inbound events)
//! - Event bus with per-kind and wildcard handlers
//! - `ConnectionManager` - authenticated socket with backoff reconnect
//! - `Connector` seam with a `tokio-tungstenite` implementation

pub mod backoff;
pub mod bus;
pub mod manager;
pub mod protocol;
pub mod socket;

pub use backoff::{ReconnectPolicy, reconnect_delay};
pub use bus::{EventBus, Unsubscribe};
pub use manager::{ConnectionManager, ConnectionState};
pub use protocol::{
    AUTH_REJECTED_CLOSE_CODE, ClientEvent, CompletedEvent, EventKind, ExecutionErrorEvent,
    LogEvent, ScreenshotEvent, ServerEvent, StatusEvent,
};
pub use socket::{ConnectError, Connector, Incoming, Outgoing, SocketHandle, SocketPeer, WsConnector};

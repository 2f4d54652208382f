//! Contract of the external execution directory (REST surface).

use async_trait::async_trait;

use crate::{
    error::DirectoryError,
    types::{
        AgentId, CompatibilityReport, CreateSessionRequest, Session, SessionSnapshot,
        SessionSummary,
    },
};

/// Remote directory of execution sessions.
///
/// Implementations talk to the platform's REST API; the coordination layer
/// only ever goes through this trait.
#[async_trait]
pub trait ExecutionDirectory: Send + Sync {
    /// Create a new session in `Pending` status.
    async fn create_session(&self, req: &CreateSessionRequest) -> Result<Session, DirectoryError>;

    /// Ask the engine to start or resume a session.
    async fn start(&self, id: &str) -> Result<(), DirectoryError>;

    /// Ask the engine to pause a session.
    async fn pause(&self, id: &str) -> Result<(), DirectoryError>;

    /// Ask the engine to cancel a session.
    async fn cancel(&self, id: &str) -> Result<(), DirectoryError>;

    /// List sessions, newest first.
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, DirectoryError>;

    /// Fetch one session with its full log history.
    async fn get_session(&self, id: &str) -> Result<SessionSnapshot, DirectoryError>;

    /// Delete a session.
    async fn delete_session(&self, id: &str) -> Result<(), DirectoryError>;

    /// Pre-flight check that the given agents can run together.
    async fn check_compatibility(
        &self,
        agent_ids: &[AgentId],
    ) -> Result<CompatibilityReport, DirectoryError>;
}

//! REST client for the platform's execution directory.

use async_trait::async_trait;
use execlink_core::{
    AgentId, CompatibilityReport, CreateSessionRequest, DirectoryError, ExecutionDirectory,
    Session, SessionSnapshot, SessionSummary,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

#[derive(Serialize)]
struct CompatibilityRequest<'a> {
    agent_ids: &'a [AgentId],
}

/// Directory backed by the `/executions` REST endpoints.
#[derive(Clone)]
pub struct HttpDirectory {
    base_url: String,
    client: Client,
    token: Option<String>,
}

impl HttpDirectory {
    /// Create a client for the API rooted at `base_url`.
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
            token: None,
        }
    }

    /// Send `token` as a bearer credential on every request.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/executions{path}", self.base_url)
    }

    async fn send(&self, request: RequestBuilder, id: Option<&str>) -> Result<Response, DirectoryError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let resp = request
            .send()
            .await
            .map_err(|e| DirectoryError::Unreachable(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if let (StatusCode::NOT_FOUND, Some(id)) = (status, id) {
            return Err(DirectoryError::NotFound(id.to_string()));
        }

        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        let message = body["error"]
            .as_str()
            .or_else(|| body["message"].as_str())
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown error"))
            .to_string();
        debug!("Directory request failed with {status}: {message}");
        Err(DirectoryError::Http {
            status: status.as_u16(),
            message,
        })
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        id: Option<&str>,
    ) -> Result<T, DirectoryError> {
        self.send(request, id)
            .await?
            .json()
            .await
            .map_err(|e| DirectoryError::Decode(e.to_string()))
    }

    async fn command(&self, id: &str, action: &str) -> Result<(), DirectoryError> {
        let url = self.url(&format!("/{id}/{action}"));
        self.send(self.client.post(&url), Some(id)).await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionDirectory for HttpDirectory {
    async fn create_session(&self, req: &CreateSessionRequest) -> Result<Session, DirectoryError> {
        let url = self.url("");
        self.fetch(self.client.post(&url).json(req), None).await
    }

    async fn start(&self, id: &str) -> Result<(), DirectoryError> {
        self.command(id, "start").await
    }

    async fn pause(&self, id: &str) -> Result<(), DirectoryError> {
        self.command(id, "pause").await
    }

    async fn cancel(&self, id: &str) -> Result<(), DirectoryError> {
        self.command(id, "cancel").await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, DirectoryError> {
        let url = self.url("");
        self.fetch(self.client.get(&url), None).await
    }

    async fn get_session(&self, id: &str) -> Result<SessionSnapshot, DirectoryError> {
        let url = self.url(&format!("/{id}"));
        self.fetch(self.client.get(&url), Some(id)).await
    }

    async fn delete_session(&self, id: &str) -> Result<(), DirectoryError> {
        let url = self.url(&format!("/{id}"));
        self.send(self.client.delete(&url), Some(id)).await?;
        Ok(())
    }

    async fn check_compatibility(
        &self,
        agent_ids: &[AgentId],
    ) -> Result<CompatibilityReport, DirectoryError> {
        let url = self.url("/compatibility");
        let body = CompatibilityRequest { agent_ids };
        self.fetch(self.client.post(&url).json(&body), None).await
    }
}

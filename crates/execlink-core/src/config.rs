//! Client configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding [`ClientConfig::ws_url`].
pub const ENV_WS_URL: &str = "EXECLINK_WS_URL";
/// Environment variable overriding [`ClientConfig::api_url`].
pub const ENV_API_URL: &str = "EXECLINK_API_URL";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Configuration for the coordination client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint of the execution engine. Never carries credentials.
    pub ws_url: String,

    /// Base URL of the execution directory REST API.
    pub api_url: String,

    /// Reconnect policy for the transport.
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8080/ws".to_string(),
            api_url: "http://localhost:8080/api".to_string(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse a TOML document. Missing keys fall back to defaults.
    ///
    /// # Errors
    /// Returns error if the document is not valid TOML for this schema.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Load from a TOML file and apply environment overrides.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env();
        tracing::debug!("Loaded client config from {}", path.display());
        Ok(config)
    }

    /// Apply `EXECLINK_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_WS_URL) {
            self.ws_url = url;
        }
        if let Ok(url) = std::env::var(ENV_API_URL) {
            self.api_url = url;
        }
    }
}

/// Reconnect backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    #[serde(rename = "base_delay_ms", with = "duration_millis")]
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    #[serde(rename = "max_delay_ms", with = "duration_millis")]
    pub max_delay: Duration,

    /// Retries allowed after an unexpected close before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

/// Serde helpers for `Duration` as integer milliseconds.
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a Duration as milliseconds (u64).
    ///
    /// # Errors
    /// Propagates serializer errors.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize a Duration from milliseconds (u64).
    ///
    /// # Errors
    /// Propagates deserializer errors.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = ClientConfig::from_toml_str("").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.reconnect.max_attempts, 10);
    }

    #[test]
    fn test_partial_reconnect_section() {
        let raw = r#"
            ws_url = "wss://engine.example.com/ws"

            [reconnect]
            base_delay_ms = 250
            max_attempts = 3
        "#;
        let config = ClientConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.ws_url, "wss://engine.example.com/ws");
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(250));
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(30));
        assert_eq!(config.reconnect.max_attempts, 3);
    }

    #[test]
    fn test_invalid_document() {
        let err = ClientConfig::from_toml_str("reconnect = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ClientConfig::load("/nonexistent/execlink.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

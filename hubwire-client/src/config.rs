//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via HUBWIRE_CONFIG or --config)
//! 3. Environment variables

use hubwire_protocol::{ProtocolKind, DEFAULT_MAX_MESSAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default time allowed for the server to answer the handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 15_000;

/// Default idle interval after which a ping is sent.
pub const DEFAULT_KEEP_ALIVE_INTERVAL_MS: u64 = 15_000;

/// Default time without any incoming traffic before the connection is dropped.
pub const DEFAULT_SERVER_TIMEOUT_MS: u64 = 30_000;

/// Hub client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Hub endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Wire protocol negotiated during the handshake.
    pub protocol: ProtocolKind,
    pub handshake_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
    pub server_timeout_ms: u64,
    /// Largest binary message payload accepted for sending or receiving.
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            protocol: ProtocolKind::Json,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            keep_alive_interval_ms: DEFAULT_KEEP_ALIVE_INTERVAL_MS,
            server_timeout_ms: DEFAULT_SERVER_TIMEOUT_MS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("HUBWIRE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: ClientConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies `HUBWIRE_*` environment variable overrides.
    ///
    /// Unparseable numeric values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("HUBWIRE_URL") {
            self.url = url;
        }

        if let Ok(protocol) = std::env::var("HUBWIRE_PROTOCOL") {
            if let Ok(kind) = protocol.parse() {
                self.protocol = kind;
            }
        }

        if let Ok(ms) = std::env::var("HUBWIRE_HANDSHAKE_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                self.handshake_timeout_ms = ms;
            }
        }

        if let Ok(ms) = std::env::var("HUBWIRE_KEEP_ALIVE_MS") {
            if let Ok(ms) = ms.parse() {
                self.keep_alive_interval_ms = ms;
            }
        }

        if let Ok(ms) = std::env::var("HUBWIRE_SERVER_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                self.server_timeout_ms = ms;
            }
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::Validation(format!(
                "url must start with ws:// or wss://, got '{}'",
                self.url
            )));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "handshake_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.keep_alive_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "keep_alive_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.server_timeout_ms <= self.keep_alive_interval_ms {
            return Err(ConfigError::Validation(
                "server_timeout_ms must be greater than keep_alive_interval_ms".to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Validation(
                "max_message_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolKind) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_server_timeout(mut self, timeout: Duration) -> Self {
        self.server_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

//! Server configuration.
//!
//! Layered: defaults, then an optional JSON file named by `QUIRE_CONFIG`,
//! then `QUIRE_*` environment overrides, then validation.

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const ENV_CONFIG: &str = "QUIRE_CONFIG";
pub const ENV_BIND_ADDR: &str = "QUIRE_BIND_ADDR";
pub const ENV_SEND_TIMEOUT_MS: &str = "QUIRE_SEND_TIMEOUT_MS";
pub const ENV_MAX_FRAME_BYTES: &str = "QUIRE_MAX_FRAME_BYTES";
pub const ENV_TOKENS_FILE: &str = "QUIRE_TOKENS_FILE";

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Deadline for a single socket write
    pub send_timeout_ms: u64,
    /// Largest accepted WebSocket message/frame
    pub max_frame_bytes: usize,
    /// Token table for the static identity provider
    pub tokens_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            send_timeout_ms: 5_000,
            max_frame_bytes: 1024 * 1024,
            tokens_file: None,
        }
    }
}

impl ServerConfig {
    /// Defaults, the `QUIRE_CONFIG` file if set, then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(ENV_CONFIG) {
            Ok(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (the process environment in
    /// production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            self.bind_addr = addr;
        }
        if let Some(value) = lookup(ENV_SEND_TIMEOUT_MS) {
            self.send_timeout_ms = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: ENV_SEND_TIMEOUT_MS,
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(ENV_MAX_FRAME_BYTES) {
            self.max_frame_bytes = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: ENV_MAX_FRAME_BYTES,
                value: value.clone(),
            })?;
        }
        if let Some(path) = lookup(ENV_TOKENS_FILE) {
            self.tokens_file = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("bind_addr cannot be empty".to_string()));
        }
        if self.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid("send_timeout_ms must be > 0".to_string()));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("max_frame_bytes must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

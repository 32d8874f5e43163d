//! Application configuration
//!
//! Loaded from a TOML file (`AGENTLINE_CONFIG` or `~/.agentline/config.toml`),
//! then overridden by environment variables. Every section has defaults so an
//! empty or missing file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub runtime: RuntimeSection,
    pub bridge: BridgeConfig,
    pub query: QuerySection,
    pub storage: StorageSection,
    pub directory: DirectorySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: constants::server::DEFAULT_BIND.to_string(),
            port: constants::server::DEFAULT_PORT,
        }
    }
}

/// Upstream agent runtime endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// Streaming invocation endpoint; sessions are stopped under `{invoke_url}/sessions/{id}/stop`
    pub invoke_url: Option<String>,
    pub api_key: Option<String>,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            invoke_url: None,
            api_key: None,
            connect_timeout_secs: constants::runtime::CONNECT_TIMEOUT_SECS,
            read_timeout_secs: constants::runtime::READ_TIMEOUT_SECS,
        }
    }
}

impl RuntimeSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Tuning for the worker thread that drains the upstream body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub queue_capacity: usize,
    pub read_chunk_size: usize,
    pub soft_truncation_min_frames: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: constants::bridge::QUEUE_CAPACITY,
            read_chunk_size: constants::bridge::READ_CHUNK_SIZE,
            soft_truncation_min_frames: constants::bridge::SOFT_TRUNCATION_MIN_FRAMES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySection {
    pub max_concurrent_per_principal: usize,
    pub disconnect_poll_ms: u64,
}

impl Default for QuerySection {
    fn default() -> Self {
        Self {
            max_concurrent_per_principal: constants::query::MAX_CONCURRENT_PER_PRINCIPAL,
            disconnect_poll_ms: constants::query::DISCONNECT_POLL_MS,
        }
    }
}

impl QuerySection {
    pub fn disconnect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.disconnect_poll_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub database_path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_path: paths::database_path(),
        }
    }
}

/// Where the account directory is read from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySection {
    pub accounts_file: Option<PathBuf>,
}

impl AppConfig {
    /// Load from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("AGENTLINE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| paths::config_file());
        let mut config = Self::load_from(&path)?;
        config.apply_env();
        Ok(config)
    }

    /// Load a config file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(url) = lookup("AGENTLINE_RUNTIME_URL") {
            self.runtime.invoke_url = Some(url);
        }
        if let Some(key) = lookup("AGENTLINE_RUNTIME_API_KEY") {
            self.runtime.api_key = Some(key);
        }
        if let Some(path) = lookup("AGENTLINE_DB_PATH") {
            self.storage.database_path = PathBuf::from(path);
        }
        match lookup("AGENTLINE_MAX_CONCURRENT_QUERIES").map(|v| v.parse::<usize>()) {
            Some(Ok(limit)) if limit > 0 => self.query.max_concurrent_per_principal = limit,
            Some(_) => tracing::warn!("Ignoring invalid AGENTLINE_MAX_CONCURRENT_QUERIES"),
            None => {}
        }
    }
}

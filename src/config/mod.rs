//! Runtime configuration.
//!
//! Resolution order: built-in defaults, then the TOML config file, then
//! `FLOWRUN_*` environment variables. `load` never fails; an unreadable
//! file is logged and skipped so the engine can always come up.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the sqlite database file. `None` runs on an in-memory
    /// database, which only makes sense for tests and experiments.
    pub database_path: Option<PathBuf>,
    /// Period of the per-run tick streams, in seconds.
    pub tick_interval_seconds: u64,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the compute agent. Remote work types are unavailable
    /// without one.
    pub endpoint: Option<String>,
    /// Request timeout for agent calls, in seconds.
    pub timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            tick_interval_seconds: 1,
            agent: AgentConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_seconds: 30,
        }
    }
}

impl Config {
    /// Load configuration from the default locations.
    pub fn load() -> Self {
        let mut config = Self::from_file().unwrap_or_default();
        config.apply_env();
        config
    }

    /// Parse a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|e| crate::Error::Config(format!("Invalid configuration: {}", e)))
    }

    fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("FLOWRUN_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("flowrun").join("config.toml"))
    }

    fn from_file() -> Option<Self> {
        let path = Self::config_path()?;
        let raw = std::fs::read_to_string(&path).ok()?;
        match Self::from_toml(&raw) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable config file");
                None
            }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("FLOWRUN_DATABASE") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Ok(value) = std::env::var("FLOWRUN_TICK_INTERVAL") {
            match value.parse() {
                Ok(seconds) => self.tick_interval_seconds = seconds,
                Err(_) => warn!(value, "Ignoring invalid FLOWRUN_TICK_INTERVAL"),
            }
        }
        if let Ok(endpoint) = std::env::var("FLOWRUN_AGENT_ENDPOINT") {
            self.agent.endpoint = Some(endpoint);
        }
        if let Ok(value) = std::env::var("FLOWRUN_AGENT_TIMEOUT") {
            match value.parse() {
                Ok(seconds) => self.agent.timeout_seconds = seconds,
                Err(_) => warn!(value, "Ignoring invalid FLOWRUN_AGENT_TIMEOUT"),
            }
        }
    }
}

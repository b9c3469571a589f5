//! Application configuration management.
//!
//! This module handles loading the configuration, which includes
//! the API base URL, the unauthenticated entry point, the persistence backend
//! and the development-only logging and strategy settings.
//!
//! Configuration is stored at `~/.config/sessionward/config.json`, with
//! `SESSIONWARD_*` environment variables taking precedence.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::envelope::CodeConvention;
use crate::api::pipeline::LogSettings;
use crate::navigation::DEFAULT_ENTRY_PATH;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "sessionward";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Durable credential file name in the cache directory
const SESSION_FILE: &str = "session.json";

/// Default API base URL (local development server)
const DEFAULT_API_BASE_URL: &str = "http://localhost:8200";

/// Request timeout in milliseconds.
/// 10s tolerates a slow backend without leaving the user staring at a spinner.
const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Retries for rate-limited (429) requests
const DEFAULT_MAX_RETRIES: u32 = 1;

/// Local device-info service queried for the MAC address sent at login
const DEFAULT_MAC_SERVICE_URL: &str = "http://localhost:8102/mac";

/// Name of the default resolver strategy
pub const DEFAULT_STRATEGY: &str = "chain";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown {kind} strategy '{name}' (available: {available})")]
    UnknownStrategy {
        kind: &'static str,
        name: String,
        available: String,
    },

    #[error("development tools are disabled")]
    DevToolsDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Persistence {
    /// JSON file in the cache directory
    #[default]
    File,
    /// OS keychain
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub entry_path: String,
    pub persistence: Persistence,
    /// Mirror the credential into the session-scoped store
    pub mirror_session: bool,
    pub codes: CodeConvention,
    /// Fixed device MAC address; skips the device-info lookup when valid
    pub mac_address: Option<String>,
    pub mac_service_url: String,
    /// Enables the development-only runtime configuration surface
    pub dev: bool,
    pub auth_strategy: String,
    pub expiry_strategy: String,
    pub logging: LogSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            entry_path: DEFAULT_ENTRY_PATH.to_string(),
            persistence: Persistence::default(),
            mirror_session: true,
            codes: CodeConvention::default(),
            mac_address: None,
            mac_service_url: DEFAULT_MAC_SERVICE_URL.to_string(),
            dev: false,
            auth_strategy: DEFAULT_STRATEGY.to_string(),
            expiry_strategy: DEFAULT_STRATEGY.to_string(),
            logging: LogSettings::default(),
        }
    }
}

impl Config {
    /// Load the config file (defaults when absent) and apply environment
    /// overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Override fields from `SESSIONWARD_*` variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SESSIONWARD_API_BASE_URL").filter(|v| !v.is_empty()) {
            self.api_base_url = url;
        }
        if let Some(path) = lookup("SESSIONWARD_ENTRY_PATH").filter(|v| !v.is_empty()) {
            self.entry_path = path;
        }
        if let Some(mac) = lookup("SESSIONWARD_MAC_ADDRESS").filter(|v| !v.is_empty()) {
            self.mac_address = Some(mac);
        }
        if let Some(dev) = lookup("SESSIONWARD_DEV") {
            self.dev = dev.eq_ignore_ascii_case("true");
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Location of the file-backed durable store
    pub fn session_file(&self) -> Result<PathBuf> {
        Ok(self.cache_dir()?.join(SESSION_FILE))
    }
}

//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! the API endpoint, session tuning, where the session is persisted, and the
//! last used username.
//!
//! Configuration is stored at `~/.config/fitfeed/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::DEFAULT_GRAPHQL_URL;
use crate::auth::SessionSettings;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "fitfeed";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the configured endpoint
pub const GRAPHQL_URL_ENV: &str = "FITFEED_GRAPHQL_URL";

/// Where the session record is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    /// `session.json` in the cache directory
    #[default]
    File,
    /// The OS keychain
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub graphql_url: Option<String>,
    pub refresh_margin_secs: Option<u64>,
    pub default_token_validity_secs: Option<u64>,
    pub session_backend: SessionBackend,
    pub last_username: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
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

    /// Endpoint to talk to: environment, then config file, then default
    pub fn graphql_url(&self) -> String {
        self.resolve_graphql_url(std::env::var(GRAPHQL_URL_ENV).ok())
    }

    fn resolve_graphql_url(&self, from_env: Option<String>) -> String {
        from_env
            .filter(|url| !url.trim().is_empty())
            .or_else(|| self.graphql_url.clone())
            .unwrap_or_else(|| DEFAULT_GRAPHQL_URL.to_string())
    }

    pub fn session_settings(&self) -> SessionSettings {
        let defaults = SessionSettings::default();
        SessionSettings {
            refresh_margin: self
                .refresh_margin_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.refresh_margin),
            default_token_validity: self
                .default_token_validity_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_token_validity),
        }
    }
}

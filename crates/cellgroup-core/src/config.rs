//! Application configuration management.
//!
//! This module handles loading and saving the configuration: the backend
//! endpoint, its API key, the active cell group and sync tuning.
//!
//! Configuration is stored at `~/.config/cellgroup/config.json`. The
//! `CELLGROUP_BACKEND_URL`, `CELLGROUP_API_KEY` and `CELLGROUP_CELL_ID`
//! environment variables take precedence over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sync::SyncOptions;

/// Application name used for config/data directory paths
const APP_NAME: &str = "cellgroup";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_BACKEND_URL: &str = "CELLGROUP_BACKEND_URL";
const ENV_API_KEY: &str = "CELLGROUP_API_KEY";
const ENV_CELL_ID: &str = "CELLGROUP_CELL_ID";

/// Data subdirectory used before a cell group is chosen.
const DEFAULT_SCOPE: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub backend_url: Option<String>,
    pub api_key: Option<String>,
    pub cell_id: Option<String>,
    #[serde(default)]
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub max_attempts: u32,
    pub request_timeout_secs: u64,
    pub connectivity_poll_secs: u64,
    /// Path probed for reachability, relative to the backend URL.
    pub health_path: String,
    pub cache_stale_minutes: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            request_timeout_secs: 30,
            connectivity_poll_secs: 15,
            health_path: "rest/v1/".to_string(),
            cache_stale_minutes: 60,
        }
    }
}

impl SyncSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.connectivity_poll_secs.max(1))
    }

    pub fn to_options(&self) -> SyncOptions {
        SyncOptions {
            max_attempts: self.max_attempts.max(1),
            request_timeout: self.request_timeout(),
        }
    }
}

impl Config {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        Ok(Self::load_from(&Self::config_path()?)?.with_env_overrides())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Replace fields with any set, non-empty environment variable.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |name| lookup(name).filter(|v: &String| !v.trim().is_empty());
        if let Some(url) = value(ENV_BACKEND_URL) {
            self.backend_url = Some(url);
        }
        if let Some(key) = value(ENV_API_KEY) {
            self.api_key = Some(key);
        }
        if let Some(cell) = value(ENV_CELL_ID) {
            self.cell_id = Some(cell);
        }
        self
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the queue, cache and logs for the active cell.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        let scope = self.cell_id.as_deref().unwrap_or(DEFAULT_SCOPE);
        Ok(data_dir.join(APP_NAME).join(scope))
    }

    pub fn backend_url(&self) -> Result<&str> {
        self.backend_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Backend URL not configured (set {})", ENV_BACKEND_URL))
    }

    pub fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("API key not configured (set {})", ENV_API_KEY))
    }

    pub fn cell_id(&self) -> Result<&str> {
        self.cell_id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Cell group not configured (set {})", ENV_CELL_ID))
    }

    /// URL probed to decide whether the backend is reachable.
    pub fn health_url(&self) -> Result<String> {
        let base = self.backend_url()?.trim_end_matches('/');
        let path = self.sync.health_path.trim_start_matches('/');
        Ok(format!("{}/{}", base, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert!(config.backend_url.is_none());
        assert_eq!(config.sync, SyncSettings::default());
        assert_eq!(config.sync.to_options().max_attempts, 5);
    }

    #[test]
    fn test_save_and_load_roundtrip_with_partial_sync_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{"backend_url":"https://db.example.org","sync":{"max_attempts":3}}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.sync.max_attempts, 3);
        assert_eq!(config.sync.request_timeout_secs, 30);

        config.save_to(&path).unwrap();
        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.backend_url.as_deref(), Some("https://db.example.org"));
        assert_eq!(reloaded.sync.max_attempts, 3);
    }

    #[test]
    fn test_env_overrides_skip_empty_values() {
        let config = Config {
            backend_url: Some("https://old.example.org".to_string()),
            cell_id: Some("c1".to_string()),
            ..Default::default()
        }
        .with_overrides(|name| match name {
            ENV_BACKEND_URL => Some("https://new.example.org".to_string()),
            ENV_CELL_ID => Some("  ".to_string()),
            _ => None,
        });

        assert_eq!(config.backend_url.as_deref(), Some("https://new.example.org"));
        assert_eq!(config.cell_id.as_deref(), Some("c1"));
        assert!(config.api_key().is_err());
    }

    #[test]
    fn test_health_url_joins_path() {
        let config = Config {
            backend_url: Some("https://db.example.org/".to_string()),
            ..Default::default()
        };
        assert_eq!(config.health_url().unwrap(), "https://db.example.org/rest/v1/");
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}

//! CLI configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use jobsync_storage::StoreConfig;
use jobsync_sync::{RemoteConfig, SyncConfig};

/// Settings read from `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Local SQLite database.
    pub database_path: PathBuf,
    /// File holding the field encryption key.
    pub key_path: PathBuf,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub corruption_cooldown_secs: Option<u64>,
}

impl AppConfig {
    /// Platform data directory for JobSync.
    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("jobsync")
    }

    pub fn default_path() -> PathBuf {
        Self::default_dir().join("config.json")
    }

    /// Configuration keeping all files under `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            database_path: dir.join("local.sqlite"),
            key_path: dir.join("field.key"),
            remote: None,
            sync: SyncConfig::default(),
            corruption_cooldown_secs: None,
        }
    }

    /// Load from `path`, or fall back to defaults next to it.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
            return Ok(Self::in_dir(&dir));
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn store_config(&self) -> StoreConfig {
        let mut config = StoreConfig::at(&self.database_path);
        if let Some(secs) = self.corruption_cooldown_secs {
            config.corruption_cooldown_secs = secs;
        }
        config
    }
}

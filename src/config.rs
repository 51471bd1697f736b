//! Configuration and persisted reader settings.
//!
//! `Config` is loaded once from TOML and is read-only afterwards. Settings
//! the user changes at runtime live in a [`SettingsStore`], whose only
//! mutator applies a change and persists it in one step.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::archive::ArchiveConfig;
use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::vault::storage::write_atomic;
use crate::vault::VaultConfig;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub archive: ArchiveConfig,
    pub cache: CacheConfig,
    pub vault: VaultConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.archive.validate().context("invalid [archive] section")?;
        self.cache.validate().context("invalid [cache] section")?;
        self.vault.validate().context("invalid [vault] section")?;
        Ok(())
    }
}

/// User-adjustable reading preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderSettings {
    pub prefetch_ahead: usize,
    pub prefetch_behind: usize,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            prefetch_ahead: 2,
            prefetch_behind: 1,
        }
    }
}

/// JSON-backed settings. Reads are snapshots; writes go through `update`.
pub struct SettingsStore {
    path: PathBuf,
    current: Mutex<ReaderSettings>,
}

impl SettingsStore {
    /// Open the store at `path`, starting from defaults if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let current = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::InvalidConfig(format!("settings file: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ReaderSettings::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            current: Mutex::new(current),
        })
    }

    pub fn get(&self) -> Result<ReaderSettings> {
        self.current
            .lock()
            .map(|settings| settings.clone())
            .map_err(|_| Error::InvalidConfig("settings lock poisoned".to_string()))
    }

    /// Apply `change` and persist the result. Nothing changes in memory if
    /// persisting fails.
    pub fn update<F>(&self, change: F) -> Result<ReaderSettings>
    where
        F: FnOnce(&mut ReaderSettings),
    {
        let mut current = self
            .current
            .lock()
            .map_err(|_| Error::InvalidConfig("settings lock poisoned".to_string()))?;

        let mut next = current.clone();
        change(&mut next);
        if next == *current {
            return Ok(next);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&next)
            .map_err(|e| Error::InvalidConfig(format!("settings encode: {e}")))?;
        write_atomic(&self.path, &json)?;

        debug!("Persisted reader settings to {}", self.path.display());
        *current = next.clone();
        Ok(next)
    }
}

//! Configuration management.
//!
//! Two layers live here:
//! - `CacheConfig`: the process-wide tunables handed to the cache at startup.
//! - `Config`: the on-disk settings file, stored at
//!   `~/.config/opscache/config.json`, from which a `CacheConfig` is built.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::CacheError;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "opscache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Entries older than this are reloaded even if never marked stale (7 days).
pub const DEFAULT_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;

/// Entries older than this are still served but reported as aging (1 day).
pub const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 24 * 60 * 60;

/// Delay before the change feed re-subscribes after a transport failure.
pub const DEFAULT_RESUBSCRIBE_BACKOFF_SECS: u64 = 5;

/// Name of the durable slot the entry store is written to.
pub const DEFAULT_SLOT_NAME: &str = "opscache-store";

/// Runtime tunables. Set once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_age: Duration,
    pub refresh_threshold: Duration,
    pub resubscribe_backoff: Duration,
    pub slot_name: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(DEFAULT_MAX_AGE_SECS),
            refresh_threshold: Duration::from_secs(DEFAULT_REFRESH_THRESHOLD_SECS),
            resubscribe_backoff: Duration::from_secs(DEFAULT_RESUBSCRIBE_BACKOFF_SECS),
            slot_name: DEFAULT_SLOT_NAME.to_string(),
        }
    }
}

impl CacheConfig {
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_refresh_threshold(mut self, threshold: Duration) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    pub fn with_resubscribe_backoff(mut self, backoff: Duration) -> Self {
        self.resubscribe_backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.max_age.is_zero() {
            return Err(CacheError::Config("max_age must be greater than zero".into()));
        }
        if self.refresh_threshold > self.max_age {
            return Err(CacheError::Config(format!(
                "refresh_threshold ({}s) exceeds max_age ({}s)",
                self.refresh_threshold.as_secs(),
                self.max_age.as_secs()
            )));
        }
        if self.slot_name.trim().is_empty() {
            return Err(CacheError::Config("slot_name must not be empty".into()));
        }
        Ok(())
    }

    /// `max_age` as a chrono duration, saturating on overflow.
    pub(crate) fn max_age_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX)
    }

    pub(crate) fn refresh_threshold_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.refresh_threshold).unwrap_or(chrono::Duration::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    /// Separates cache directories when several sessions share a machine.
    pub profile: Option<String>,
    pub max_age_secs: Option<u64>,
    pub refresh_threshold_secs: Option<u64>,
    pub resubscribe_backoff_secs: Option<u64>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Read settings from `path`; a missing file means defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Invalid settings file {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;

        let mut path = cache_dir.join(APP_NAME);
        if let Some(ref profile) = self.profile {
            path = path.join(profile);
        }
        Ok(path)
    }

    /// Build the runtime config, falling back to defaults for unset fields.
    pub fn cache_config(&self) -> Result<CacheConfig> {
        let defaults = CacheConfig::default();
        let max_age = self
            .max_age_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_age);
        let config = CacheConfig {
            max_age,
            // An unset threshold never exceeds a shortened max age
            refresh_threshold: self
                .refresh_threshold_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| defaults.refresh_threshold.min(max_age)),
            resubscribe_backoff: self
                .resubscribe_backoff_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.resubscribe_backoff),
            slot_name: defaults.slot_name,
        };
        config.validate()?;
        Ok(config)
    }
}

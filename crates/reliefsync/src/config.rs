//! Configuration management for reliefsync.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "reliefsync";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "offline.db";

/// Background sync tag registered with the worker.
pub const DEFAULT_SYNC_TAG: &str = "milestone-sync";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `RELIEFSYNC_`, sections split by `__`)
/// 2. TOML config file at `~/.config/reliefsync/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Remote API configuration.
    pub api: ApiConfig,
    /// Sync timing configuration.
    pub sync: SyncConfig,
    /// Background worker configuration.
    pub worker: WorkerConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/reliefsync/offline.db`
    pub database_path: Option<PathBuf>,
}

/// Remote API configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL relative mutation endpoints resolve against.
    pub base_url: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Path probed to decide whether the network is usable.
    pub health_path: String,
}

/// Sync timing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long the `synced` status is shown before returning to idle.
    pub synced_decay_ms: u64,
    /// How long the `error` status is shown before returning to idle.
    pub error_decay_ms: u64,
    /// Interval between connectivity probes in milliseconds.
    pub probe_interval_ms: u64,
}

/// Build environment of the running application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development; the background worker is not registered.
    Development,
    /// Production-like deployment.
    #[default]
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
        }
    }
}

/// Background worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Build environment.
    pub environment: Environment,
    /// Version of the worker being registered.
    pub version: String,
    /// Whether the platform offers background sync.
    pub background_sync: bool,
    /// Tag requested for background sync.
    pub sync_tag: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            timeout_secs: 30,
            health_path: "/".to_string(),
        }
    }
}

impl ApiConfig {
    /// Get the request timeout as a Duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Full URL of the connectivity probe.
    #[must_use]
    pub fn health_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if self.health_path.starts_with('/') {
            format!("{base}{}", self.health_path)
        } else {
            format!("{base}/{}", self.health_path)
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            synced_decay_ms: 3_000,
            error_decay_ms: 5_000,
            probe_interval_ms: 10_000,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            background_sync: true,
            sync_tag: DEFAULT_SYNC_TAG.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("RELIEFSYNC_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let base_url = self.api.base_url.trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::ConfigValidation {
                message: format!("base_url must be an http(s) URL, got '{base_url}'"),
            });
        }

        if self.api.timeout_secs == 0 {
            return Err(Error::ConfigValidation {
                message: "timeout_secs must be greater than 0".to_string(),
            });
        }

        for (name, value) in [
            ("synced_decay_ms", self.sync.synced_decay_ms),
            ("error_decay_ms", self.sync.error_decay_ms),
            ("probe_interval_ms", self.sync.probe_interval_ms),
        ] {
            if value == 0 {
                return Err(Error::ConfigValidation {
                    message: format!("{name} must be greater than 0"),
                });
            }
        }

        if self.worker.sync_tag.trim().is_empty() {
            return Err(Error::ConfigValidation {
                message: "sync_tag cannot be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the synced-status decay as a Duration.
    #[must_use]
    pub fn synced_decay(&self) -> Duration {
        Duration::from_millis(self.sync.synced_decay_ms)
    }

    /// Get the error-status decay as a Duration.
    #[must_use]
    pub fn error_decay(&self) -> Duration {
        Duration::from_millis(self.sync.error_decay_ms)
    }

    /// Get the connectivity probe interval as a Duration.
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.sync.probe_interval_ms)
    }
}

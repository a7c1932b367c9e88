//! Configuration module for Hoard.

use serde::Deserialize;
use std::path::Path;

use crate::{HoardError, Result};

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Maximum number of pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> String {
    "data/hoard.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the bootstrap local policy.
    #[serde(default = "default_local_root")]
    pub local_root: String,
    /// Content below this size is handed to the indexing hook as text.
    #[serde(default = "default_index_text_limit")]
    pub index_text_limit_bytes: usize,
}

fn default_local_root() -> String {
    "data/storage".to_string()
}

fn default_index_text_limit() -> usize {
    1024 * 1024
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_root: default_local_root(),
            index_text_limit_bytes: default_index_text_limit(),
        }
    }
}

/// Quota configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Total bytes granted to newly created owners.
    #[serde(default = "default_total_bytes")]
    pub default_total_bytes: i64,
}

fn default_total_bytes() -> i64 {
    10 * 1024 * 1024 * 1024
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_total_bytes: default_total_bytes(),
        }
    }
}

/// Recycle bin configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecycleConfig {
    /// Enable the background sweep.
    #[serde(default = "default_recycle_enabled")]
    pub enabled: bool,
    /// Recycled nodes older than this many days are purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Sweep interval in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_recycle_enabled() -> bool {
    true
}

fn default_retention_days() -> i64 {
    30
}

fn default_sweep_interval() -> u64 {
    24 * 60 * 60
}

impl Default for RecycleConfig {
    fn default() -> Self {
        Self {
            enabled: default_recycle_enabled(),
            retention_days: default_retention_days(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path. Empty disables file logging.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/hoard.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Quota configuration.
    #[serde(default)]
    pub quota: QuotaConfig,
    /// Recycle bin configuration.
    #[serde(default)]
    pub recycle: RecycleConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(HoardError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| HoardError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `HOARD_DB_PATH`: Override the database path
    /// - `HOARD_STORAGE_ROOT`: Override the bootstrap local storage root
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("HOARD_DB_PATH") {
            if !path.is_empty() {
                self.database.path = path;
            }
        }
        if let Ok(root) = std::env::var("HOARD_STORAGE_ROOT") {
            if !root.is_empty() {
                self.storage.local_root = root;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.recycle.retention_days <= 0 {
            return Err(HoardError::Config(
                "recycle.retention_days must be at least 1".to_string(),
            ));
        }
        if self.recycle.sweep_interval_secs == 0 {
            return Err(HoardError::Config(
                "recycle.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(HoardError::Config(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        if self.quota.default_total_bytes < 0 {
            return Err(HoardError::Config(
                "quota.default_total_bytes must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

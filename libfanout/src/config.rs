//! Configuration management for Fanout
//!
//! ```toml
//! [database]
//! path = "~/.local/share/fanout/fanout.db"
//!
//! [scheduling]
//! default_interval_ms = 500
//! poll_interval_secs = 5
//!
//! [scheduling.intervals]
//! weasyl = 3000
//!
//! [destinations.weasyl]
//! command = "weasyl-upload"
//! args = ["--rating", "general"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};
use crate::ledger::{IntervalTable, DEFAULT_INTERVAL_MS, FLOOR_DELAY_MS, LONG_WAIT_THRESHOLD_MS};

pub const CONFIG_ENV: &str = "FANOUT_CONFIG";
pub const DB_PATH_ENV: &str = "FANOUT_DB_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    /// Command adapters keyed by destination name
    #[serde(default)]
    pub destinations: BTreeMap<String, CommandConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/fanout/fanout.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub default_interval_ms: u64,
    pub floor_delay_ms: u64,
    pub long_wait_threshold_ms: u64,
    /// How often the daemon re-reads the queue for changes made elsewhere
    pub poll_interval_secs: u64,
    /// Per-destination minimum intervals, on top of the built-in ones
    pub intervals: BTreeMap<String, u64>,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: DEFAULT_INTERVAL_MS,
            floor_delay_ms: FLOOR_DELAY_MS,
            long_wait_threshold_ms: LONG_WAIT_THRESHOLD_MS,
            poll_interval_secs: 5,
            intervals: BTreeMap::new(),
        }
    }
}

/// A destination posted to by running an external program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    /// Load configuration from the default location, or defaults if there is no file
    pub fn load() -> Result<Self> {
        let path = resolve_config_path()?;
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from_path(&path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        if self.scheduling.floor_delay_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduling.floor_delay_ms".to_string(),
                reason: "must be greater than zero".to_string(),
            }
            .into());
        }
        if self.scheduling.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduling.poll_interval_secs".to_string(),
                reason: "must be greater than zero".to_string(),
            }
            .into());
        }
        for (name, destination) in &self.destinations {
            if destination.command.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "destinations.{}.command",
                    name
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Database path, honoring `FANOUT_DB_PATH` and expanding `~`
    pub fn database_path(&self) -> String {
        let raw = std::env::var(DB_PATH_ENV).unwrap_or_else(|_| self.database.path.clone());
        shellexpand::tilde(&raw).to_string()
    }

    /// Minimum-interval table: built-in entries overlaid with configured ones
    pub fn interval_table(&self) -> IntervalTable {
        let scheduling = &self.scheduling;
        let mut table = IntervalTable::default().with_default(scheduling.default_interval_ms);
        for (name, ms) in &scheduling.intervals {
            table = table.with_interval(name.clone(), *ms);
        }
        table
            .with_floor(scheduling.floor_delay_ms)
            .with_long_wait_threshold(scheduling.long_wait_threshold_ms)
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("fanout").join("config.toml"))
}

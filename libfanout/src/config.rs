//! Configuration management for Fanout

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, FanoutError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub posting: PostingConfig,
    /// Per-website overrides, keyed by website name
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostingConfig {
    /// Destinations of one group posted to at the same time
    #[serde(default = "default_max_concurrent_destinations")]
    pub max_concurrent_destinations: usize,
    /// Buffer size of the progress notification bus
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_max_concurrent_destinations() -> usize {
    8
}

fn default_event_bus_capacity() -> usize {
    100
}

impl Default for PostingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_destinations: default_max_concurrent_destinations(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Minimum time between posts to one account, e.g. "30s" or "2m"
    pub min_interval: String,
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/fanout/fanout.db".to_string(),
            },
            posting: PostingConfig::default(),
            rate_limits: HashMap::new(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        if self.posting.max_concurrent_destinations == 0 {
            return Err(ConfigError::InvalidValue {
                field: "posting.max_concurrent_destinations".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        self.rate_limit_floors()?;
        Ok(())
    }

    /// Parsed per-website minimum intervals
    pub fn rate_limit_floors(&self) -> Result<HashMap<String, Duration>> {
        self.rate_limits
            .iter()
            .map(|(website, limit)| {
                humantime::parse_duration(&limit.min_interval)
                    .map(|interval| (website.clone(), interval))
                    .map_err(|e| {
                        FanoutError::from(ConfigError::InvalidValue {
                            field: format!("rate_limits.{}.min_interval", website),
                            reason: e.to_string(),
                        })
                    })
            })
            .collect()
    }

    /// Database path with `~` expanded
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).to_string())
    }
}

/// Resolve the configuration file path (`FANOUT_CONFIG`, then the XDG config dir)
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("FANOUT_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("fanout").join("config.toml"))
}

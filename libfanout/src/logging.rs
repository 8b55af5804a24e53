//! Logging setup for hosts embedding the engine
//!
//! The engine itself only emits `tracing` events; hosts decide where they go.
//! This module gives them a one-call subscriber with text, JSON or pretty
//! output on stderr.
//!
//! # Examples
//!
//! ```no_run
//! use libfanout::logging::{LogFormat, LoggingConfig};
//!
//! // JSON lines for a service host
//! LoggingConfig::new(LogFormat::Json, "info").init();
//!
//! // Or read FANOUT_LOG_FORMAT / FANOUT_LOG_LEVEL
//! libfanout::logging::init_default();
//! ```

use std::str::FromStr;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Plain text, no colors
    Text,
    /// One JSON object per line
    Json,
    /// Multi-line with colors, for development
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!(
                "Invalid log format: '{}'. Valid options: text, json, pretty",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
            LogFormat::Pretty => write!(f, "pretty"),
        }
    }
}

/// Subscriber settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Filter directive used when `RUST_LOG` is unset, e.g. "info" or "libfanout=debug"
    pub level: String,
}

impl LoggingConfig {
    pub fn new(format: LogFormat, level: impl Into<String>) -> Self {
        Self {
            format,
            level: level.into(),
        }
    }

    /// Read `FANOUT_LOG_FORMAT` and `FANOUT_LOG_LEVEL`, defaulting to text/info
    pub fn from_env() -> Self {
        let format = std::env::var("FANOUT_LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(LogFormat::Text);
        let level = std::env::var("FANOUT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Self::new(format, level)
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }

    /// Install the global subscriber
    ///
    /// Returns an error if a global subscriber is already installed, which
    /// happens when a host and a test harness both initialize logging.
    pub fn try_init(&self) -> Result<(), String> {
        let filter = self.filter();

        let result = match self.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .flatten_event(true)
                .with_target(true)
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true)
                .try_init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(true)
                .try_init(),
        };

        result.map_err(|e| e.to_string())
    }

    /// Install the global subscriber, ignoring an already-installed one
    pub fn init(&self) {
        if let Err(e) = self.try_init() {
            tracing::debug!("Logging already initialized: {}", e);
        }
    }
}

/// Initialize logging from environment variables
pub fn init_default() {
    LoggingConfig::from_env().init();
}

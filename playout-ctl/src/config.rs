//! Configuration for the playlist controller
//!
//! Settings come from an optional TOML file resolved by
//! `playout_common::config` (CLI path, `PLAYOUT_CONFIG`, platform config
//! directory). Every field has a built-in default, so an absent file or an
//! empty table yields a working configuration.
//!
//! ```toml
//! preroll_start_ms = 2000
//! preroll_end_ms = 2000
//! event_capacity = 1000
//! clock_resync_ms = 250
//!
//! [logging]
//! level = "info"
//! ```

use crate::error::{Error, Result};
use playout_common::config::{self as common_config, CONFIG_ENV_VAR};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Controller settings
///
/// Millisecond values are signed so that a negative value in a config file
/// is reported as an invalid configuration rather than a parse failure.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Lead time of `StartTimeNear` applied to every managed item
    pub preroll_start_ms: i64,

    /// Lead time of `EndTimeNear` applied to every managed item
    pub preroll_end_ms: i64,

    /// Capacity of the outward event bus
    pub event_capacity: usize,

    /// Longest single sleep of a deadline wait before the wall clock is re-read
    pub clock_resync_ms: i64,

    /// Logging configuration (optional)
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            preroll_start_ms: 2000,
            preroll_end_ms: 2000,
            event_capacity: 1000,
            clock_resync_ms: 250,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load and validate configuration
    ///
    /// `cli_path` takes priority over the `PLAYOUT_CONFIG` environment
    /// variable and the platform config directory.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let config: Self = common_config::load_or_default(cli_path, CONFIG_ENV_VAR)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = common_config::parse_toml(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject non-positive timings and a zero-capacity event bus
    pub fn validate(&self) -> Result<()> {
        positive_millis("preroll_start_ms", self.preroll_start_ms)?;
        positive_millis("preroll_end_ms", self.preroll_end_ms)?;
        positive_millis("clock_resync_ms", self.clock_resync_ms)?;
        if self.event_capacity == 0 {
            return Err(Error::InvalidConfiguration(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn preroll_start(&self) -> Duration {
        millis(self.preroll_start_ms)
    }

    pub fn preroll_end(&self) -> Duration {
        millis(self.preroll_end_ms)
    }

    pub fn clock_resync(&self) -> Duration {
        millis(self.clock_resync_ms)
    }
}

fn positive_millis(name: &str, value: i64) -> Result<()> {
    if value <= 0 {
        return Err(Error::InvalidConfiguration(format!(
            "{} must be positive and not zero (got {})",
            name, value
        )));
    }
    Ok(())
}

fn millis(value: i64) -> Duration {
    Duration::from_millis(value.max(0) as u64)
}

//! Configuration file resolution and loading
//!
//! Config file resolution follows a fixed priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. Platform config directory (`<config_dir>/playout/config.toml`)
//! 4. None: callers fall back to built-in defaults
//!
//! A missing file is never fatal. A file that exists but cannot be read or
//! parsed is reported to the caller.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "PLAYOUT_CONFIG";

/// Locate the configuration file to load
///
/// Returns `None` when no candidate exists, in which case the caller uses
/// its compiled defaults.
pub fn resolve_config_file(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config directory
    let user_config = default_config_path()?;
    if user_config.exists() {
        return Some(user_config);
    }

    None
}

/// Get default configuration file path for the platform
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("playout").join("config.toml"))
}

/// Parse a TOML document into `T`
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> Result<T> {
    Ok(toml::from_str(content)?)
}

/// Load `T` from the resolved config file, or `T::default()` when there is none
///
/// A path given explicitly (CLI or environment) that does not exist falls
/// back to defaults with a warning.
pub fn load_or_default<T>(cli_arg: Option<&Path>, env_var_name: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = resolve_config_file(cli_arg, env_var_name) else {
        debug!("No config file found, using built-in defaults");
        return Ok(T::default());
    };

    if !path.exists() {
        warn!(
            "Config file {} does not exist, using built-in defaults",
            path.display()
        );
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config = parse_toml(&content)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

//! Tests for configuration file resolution and graceful degradation
//!
//! Note: Uses serial_test crate to prevent ENV variable race conditions.
//! Tests that manipulate PLAYOUT_CONFIG are marked with #[serial].

use playout_common::config::{load_or_default, resolve_config_file, CONFIG_ENV_VAR};
use playout_common::Error;
use serde::Deserialize;
use serial_test::serial;
use std::env;
use std::io::Write;

#[derive(Debug, Default, Deserialize, PartialEq)]
struct Settings {
    #[serde(default)]
    preroll_ms: u64,
}

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_env_var_used_when_no_cli_arg() {
    let file = write_config("preroll_ms = 1500");
    env::set_var(CONFIG_ENV_VAR, file.path());

    let resolved = resolve_config_file(None, CONFIG_ENV_VAR);
    assert_eq!(resolved.as_deref(), Some(file.path()));

    let settings: Settings = load_or_default(None, CONFIG_ENV_VAR).unwrap();
    assert_eq!(settings.preroll_ms, 1500);

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_cli_arg_overrides_env_var() {
    let env_file = write_config("preroll_ms = 1");
    let cli_file = write_config("preroll_ms = 2");
    env::set_var(CONFIG_ENV_VAR, env_file.path());

    let settings: Settings = load_or_default(Some(cli_file.path()), CONFIG_ENV_VAR).unwrap();
    assert_eq!(settings.preroll_ms, 2);

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_malformed_file_is_reported() {
    let file = write_config("preroll_ms = [not toml");
    let result: Result<Settings, Error> = load_or_default(Some(file.path()), CONFIG_ENV_VAR);

    match result {
        Err(Error::Config(msg)) => assert!(msg.contains(&file.path().display().to_string())),
        other => panic!("Expected Config error, got {:?}", other),
    }
}

#[test]
#[serial]
fn test_empty_env_var_is_ignored() {
    env::set_var(CONFIG_ENV_VAR, "");
    let resolved = resolve_config_file(None, CONFIG_ENV_VAR);
    // Only the platform default may be returned, never the empty string
    assert_ne!(resolved, Some(std::path::PathBuf::from("")));
    env::remove_var(CONFIG_ENV_VAR);
}

//! Rundown and controller configuration loading tests
//!
//! Note: Tests that manipulate PLAYOUT_CONFIG are marked with #[serial].

mod helpers;

use helpers::{collect_until_stopped, count_named, names_for};
use playout_common::config::CONFIG_ENV_VAR;
use playout_common::time;
use playout_ctl::{ControllerConfig, Error, PlaylistCollection, PlaylistController, PlaylistItem, Rundown, StartMode};
use serial_test::serial;
use std::env;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn write_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_demo_rundown_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/morning_show.toml");
    let rundown = Rundown::load(&path).unwrap();

    assert_eq!(rundown.items.len(), 5);
    let timeline = rundown.timeline();
    assert_eq!(timeline[1].start, timeline[0].end);
    assert_eq!(timeline[2].start, timeline[1].end);
    assert_eq!(timeline[3].start, None);
    assert_eq!(timeline[4].start, Some(Duration::from_secs(30)));
}

#[test]
fn test_demo_config_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/config.example.toml");
    let config = ControllerConfig::load(Some(&path)).unwrap();
    assert_eq!(config, ControllerConfig::default());
}

#[test]
fn test_missing_rundown_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = Rundown::load(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(Error::Io(_))));
}

#[test]
fn test_malformed_rundown_reports_rundown_error() {
    let file = write_file("[[item]]\ntitle = \"A\"\nduration_ms = \"long\"\n");
    match Rundown::load(file.path()) {
        Err(Error::Rundown(message)) => assert!(message.contains("Invalid rundown")),
        other => panic!("Expected Rundown error, got {:?}", other),
    }
}

#[test]
#[serial]
fn test_config_from_env_var() {
    let file = write_file("preroll_start_ms = 400\n[logging]\nlevel = \"debug\"\n");
    env::set_var(CONFIG_ENV_VAR, file.path());

    let config = ControllerConfig::load(None).unwrap();
    assert_eq!(config.preroll_start(), Duration::from_millis(400));
    assert_eq!(config.preroll_end(), Duration::from_secs(2));
    assert_eq!(config.logging.level, "debug");

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_cli_config_overrides_env_var() {
    let env_file = write_file("preroll_end_ms = 100");
    let cli_file = write_file("preroll_end_ms = 900");
    env::set_var(CONFIG_ENV_VAR, env_file.path());

    let config = ControllerConfig::load(Some(cli_file.path())).unwrap();
    assert_eq!(config.preroll_end(), Duration::from_millis(900));

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_invalid_config_values_rejected_on_load() {
    let file = write_file("preroll_start_ms = 0");
    env::set_var(CONFIG_ENV_VAR, file.path());

    assert!(matches!(ControllerConfig::load(None), Err(Error::InvalidConfiguration(_))));

    env::remove_var(CONFIG_ENV_VAR);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rundown_plays_through_controller() {
    let rundown = Rundown::parse(
        r#"
[[item]]
title = "Ident"
duration_ms = 150
start_mode = "schedule"
start_in_ms = 100

[[item]]
title = "Story"
duration_ms = 200

[[item]]
title = "Spare"
duration_ms = 200
start_mode = "none"
"#,
    )
    .unwrap();
    let items = rundown.build(time::now());
    assert_eq!(items[1].schedule().start_mode(), StartMode::AutoFollow);

    let config = ControllerConfig::from_toml("preroll_start_ms = 50\npreroll_end_ms = 50").unwrap();
    let playlist = Arc::new(PlaylistCollection::from_items(items.iter().cloned()));
    let controller = PlaylistController::with_config(playlist, &config).unwrap();
    let mut rx = controller.subscribe();
    controller.initialize();

    let events = collect_until_stopped(&mut rx).await;
    assert_eq!(
        names_for(&events, "Story"),
        vec!["StartTimeNear", "StartTimeReached", "EndTimeNear", "EndTimeReached"]
    );
    assert!(names_for(&events, "Spare").is_empty());
    assert_eq!(count_named(&events, "PlaylistStarted"), 1);
    assert_eq!(count_named(&events, "PlaylistStopped"), 1);
}

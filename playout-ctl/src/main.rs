//! Playout controller (playout-ctl) - Rundown runner
//!
//! Loads a TOML rundown into a playlist, lets the controller drive it in real
//! time and reports every playlist event as it happens.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use playout_common::time;
use playout_ctl::rundown::{Rundown, RundownItem};
use playout_ctl::{ControllerConfig, PlaylistCollection, PlaylistController, PlaylistEvent, PlaylistItem, StartMode};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for playout-ctl
#[derive(Parser, Debug)]
#[command(name = "playout-ctl")]
#[command(about = "Real-time playout scheduler for rundown files")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Play a rundown in real time
    Run {
        /// Rundown file (TOML)
        rundown: PathBuf,

        /// Controller configuration file
        #[arg(short, long, env = "PLAYOUT_CONFIG")]
        config: Option<PathBuf>,

        /// Print events as JSON lines on stdout
        #[arg(long)]
        json: bool,
    },

    /// Validate a rundown and print its projected timeline
    Check {
        /// Rundown file (TOML)
        rundown: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run { rundown, config, json } => {
            let config = ControllerConfig::load(config.as_deref())
                .context("Failed to load controller configuration")?;
            init_tracing(&config.logging.level);
            run(&rundown, &config, json).await
        }
        Command::Check { rundown } => {
            init_tracing("info");
            check(&rundown)
        }
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("playout_ctl={}", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(path: &Path, config: &ControllerConfig, json: bool) -> Result<()> {
    let rundown = Rundown::load(path).with_context(|| format!("Failed to load rundown {}", path.display()))?;
    let items = rundown.build(time::now());
    info!("Loaded {} items from {}", items.len(), path.display());

    let playlist = Arc::new(PlaylistCollection::from_items(items.iter().cloned()));
    let controller = PlaylistController::with_config(Arc::clone(&playlist), config)
        .context("Failed to create playlist controller")?;
    let mut rx = controller.subscribe();
    controller.initialize();

    // Operator cue: an auto-follow first item with a start time starts the chain
    if let Some(first) = items.first() {
        let schedule = first.schedule();
        if schedule.start_mode() == StartMode::AutoFollow
            && schedule.start_time().is_some()
            && schedule.start_scheduling()
        {
            info!("Cued {}", first.label());
        }
    }

    if !any_scheduling(&items) {
        warn!("Nothing in the rundown is scheduled to play");
        return Ok(());
    }

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C, stopping playout");
                break;
            }
            received = rx.recv() => match received {
                Ok(event) => {
                    report(&event, json)?;
                    if matches!(event, PlaylistEvent::PlaylistStopped) && !any_scheduling(&items) {
                        info!("Rundown finished");
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!("Event receiver lagged, {} events missed", missed),
                Err(RecvError::Closed) => break,
            }
        }
    }

    controller.shutdown();
    Ok(())
}

fn any_scheduling(items: &[Arc<RundownItem>]) -> bool {
    items.iter().any(|item| item.schedule().is_scheduling())
}

fn report(event: &PlaylistEvent<RundownItem>, json: bool) -> Result<()> {
    let labels: Vec<String> = event.items().iter().map(|item| item.label()).collect();
    if json {
        let line = serde_json::json!({
            "event": event.name(),
            "items": labels,
            "at": time::now().to_rfc3339(),
        });
        println!("{}", serde_json::to_string(&line).context("Failed to encode event")?);
    } else if labels.is_empty() {
        info!("{}", event.name());
    } else {
        info!("{}: {}", event.name(), labels.join(", "));
    }
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let rundown = Rundown::load(path).with_context(|| format!("Invalid rundown {}", path.display()))?;

    println!("{:<4} {:<12} {:>12} {:>12}  TITLE", "#", "MODE", "START", "END");
    for (index, entry) in rundown.timeline().iter().enumerate() {
        println!(
            "{:<4} {:<12} {:>12} {:>12}  {}",
            index,
            entry.start_mode.to_string(),
            format_offset(entry.start),
            format_offset(entry.end),
            entry.title
        );
    }
    Ok(())
}

/// `+mm:ss.mmm`, or `-` for an entry that never plays
fn format_offset(offset: Option<Duration>) -> String {
    match offset {
        Some(offset) => {
            let millis = offset.as_millis();
            format!("+{:02}:{:02}.{:03}", millis / 60_000, (millis / 1000) % 60, millis % 1000)
        }
        None => "-".to_string(),
    }
}

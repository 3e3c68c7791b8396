//! Rundown files
//!
//! A rundown is a TOML list of items to play in order:
//!
//! ```toml
//! [[item]]
//! title = "Top of hour"
//! duration_ms = 5000
//! start_mode = "schedule"
//! start_in_ms = 3000
//!
//! [[item]]
//! title = "Headlines"
//! duration_ms = 20000
//! start_mode = "auto-follow"
//! ```
//!
//! `start_in_ms` is an offset from the moment the rundown is loaded. Schedule
//! items need one. On an auto-follow item it is only accepted for the first
//! item, where it acts as the operator's cue to start the chain.

use crate::error::{Error, Result};
use crate::item::{PlaylistItem, ScheduleItem, StartMode};
use chrono::{DateTime, Utc};
use playout_common::time;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Parsed rundown file
#[derive(Debug, Clone, Deserialize)]
pub struct Rundown {
    #[serde(rename = "item", default)]
    pub items: Vec<RundownEntry>,
}

/// One `[[item]]` table
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RundownEntry {
    pub title: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub start_mode: StartMode,
    pub start_in_ms: Option<u64>,
}

impl RundownEntry {
    pub fn duration(&self) -> Duration {
        time::millis_to_duration(self.duration_ms)
    }

    pub fn start_offset(&self) -> Option<Duration> {
        self.start_in_ms.map(time::millis_to_duration)
    }
}

/// Playlist item built from a rundown entry
pub struct RundownItem {
    pub title: String,
    schedule: ScheduleItem,
}

impl RundownItem {
    pub fn new(title: impl Into<String>, schedule: ScheduleItem) -> Self {
        Self {
            title: title.into(),
            schedule,
        }
    }
}

impl PlaylistItem for RundownItem {
    fn schedule(&self) -> &ScheduleItem {
        &self.schedule
    }

    fn label(&self) -> String {
        self.title.clone()
    }
}

impl std::fmt::Debug for RundownItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RundownItem")
            .field("title", &self.title)
            .field("schedule", &self.schedule)
            .finish()
    }
}

/// Projected start and end of an entry, as offsets from load time
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub title: String,
    pub start_mode: StartMode,
    pub start: Option<Duration>,
    pub end: Option<Duration>,
}

impl Rundown {
    /// Parse and validate a rundown document
    pub fn parse(content: &str) -> Result<Self> {
        let rundown: Rundown =
            toml::from_str(content).map_err(|e| Error::Rundown(format!("Invalid rundown: {}", e)))?;
        rundown.validate()?;
        Ok(rundown)
    }

    /// Read, parse and validate a rundown file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.items.is_empty() {
            return Err(Error::Rundown("Rundown contains no items".to_string()));
        }

        for (index, entry) in self.items.iter().enumerate() {
            let invalid = |reason: &str| Error::Rundown(format!("Item {} ({}): {}", index, entry.title, reason));

            if entry.title.trim().is_empty() {
                return Err(invalid("title must not be empty"));
            }
            if entry.duration_ms == 0 {
                return Err(invalid("duration_ms must be positive"));
            }
            match (entry.start_mode, entry.start_in_ms) {
                (StartMode::Schedule, None) => return Err(invalid("schedule items need start_in_ms")),
                (StartMode::Schedule, Some(0)) => {
                    return Err(invalid("start_in_ms must be positive for schedule items"))
                }
                (StartMode::AutoFollow, Some(_)) if index > 0 => {
                    return Err(invalid("start_in_ms on an auto-follow item is only allowed for the first item"))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Create playlist items with start times relative to `now`
    pub fn build(&self, now: DateTime<Utc>) -> Vec<Arc<RundownItem>> {
        self.items
            .iter()
            .map(|entry| {
                let start = entry
                    .start_offset()
                    .filter(|_| entry.start_mode != StartMode::None)
                    .map(|offset| time::add_duration(now, offset));
                let schedule = ScheduleItem::with_timing(start, entry.duration(), entry.start_mode);
                Arc::new(RundownItem::new(entry.title.clone(), schedule))
            })
            .collect()
    }

    /// Start and end of each entry if the rundown plays undisturbed
    ///
    /// Auto-follow entries start where their predecessor ends; an entry in
    /// mode `None` never plays and breaks the chain.
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        let mut previous_end: Option<Duration> = None;

        self.items
            .iter()
            .map(|entry| {
                let start = match entry.start_mode {
                    StartMode::Schedule => entry.start_offset(),
                    StartMode::AutoFollow => previous_end.or_else(|| entry.start_offset()),
                    StartMode::None => None,
                };
                let end = start.map(|s| s.saturating_add(entry.duration()));
                previous_end = end;
                TimelineEntry {
                    title: entry.title.clone(),
                    start_mode: entry.start_mode,
                    start,
                    end,
                }
            })
            .collect()
    }
}

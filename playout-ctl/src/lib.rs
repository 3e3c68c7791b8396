//! # Playout Controller Library (playout-ctl)
//!
//! Real-time playout scheduling for ordered media items.
//!
//! **Purpose:** Turn the start time, duration and start mode of each playlist
//! item into precisely timed notifications, chain auto-follow items end to
//! end, and keep track of what is playing, what is prepared next and what was
//! skipped.
//!
//! **Architecture:** One tokio task per scheduled item races the wall clock
//! against that item's deadlines; a controller composes the per-item events
//! into playlist-level events published on an `EventBus`.

pub mod collection;
pub mod config;
pub mod controller;
pub mod error;
pub mod item;
pub mod rundown;
mod scheduler;

pub use collection::{CollectionChange, ObserverId, PlaylistCollection};
pub use config::ControllerConfig;
pub use controller::{PlaylistController, PlaylistEvent};
pub use error::{Error, Result};
pub use item::{EventKind, ItemEvent, PlaylistItem, ScheduleItem, StartMode, Status};
pub use rundown::{Rundown, RundownItem};

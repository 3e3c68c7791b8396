//! # Playout Common Library
//!
//! Shared code for the playout crates:
//! - Error type shared by configuration loading
//! - Generic broadcast event bus
//! - Wall-clock helpers for deadline arithmetic
//! - Configuration file resolution

pub mod config;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
pub use events::EventBus;

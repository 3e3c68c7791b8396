//! Error types for playout-ctl
//!
//! Cancelling a monitor is not an error and never surfaces here.

use crate::item::Status;
use thiserror::Error;

/// Main error type for playout-ctl
#[derive(Error, Debug)]
pub enum Error {
    /// Non-positive preroll or other rejected setting
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Index-based collection operation outside bounds
    #[error("Index {index} out of range for playlist of length {len}")]
    OutOfRange { index: usize, len: usize },

    /// Status change that would move backward or leave a terminal status
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    /// Rundown file content is invalid
    #[error("Rundown error: {0}")]
    Rundown(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors from shared configuration loading
    #[error(transparent)]
    Common(#[from] playout_common::Error),
}

/// Convenience Result type using playout-ctl Error
pub type Result<T> = std::result::Result<T, Error>;

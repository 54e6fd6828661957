//! Error types for controller operations.

use std::time::Duration;

use thiserror::Error;
use xendev_channel::ChannelError;
use xendev_error::CommonError;
use xendev_store::StoreError;

use crate::console::ConsoleState;

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by controllers and device negotiation.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Shared error cases.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Configuration store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Channel failure.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed request, backing specification or helper output.
    #[error("invalid device request: {0}")]
    Validation(String),

    /// The tap helper refused to create a device.
    #[error("{message}\n    stdout: {stdout}\n    stderr: {stderr}")]
    Negotiation {
        message: String,
        stdout: String,
        stderr: String,
    },

    /// An external operation did not finish in time.
    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    /// An identifier space ran out.
    #[error("resource exhausted: {0}")]
    Exhausted(String),

    /// A console refused a terminal connection.
    #[error("console {console} rejected connection while {state}")]
    Rejected { console: u32, state: ConsoleState },

    /// An instance is already registered under this key.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Nothing is registered or published under this key.
    #[error("not found: {0}")]
    NotFound(String),
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Returns true for malformed input.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if helper negotiation failed or hung.
    #[must_use]
    pub const fn is_negotiation(&self) -> bool {
        matches!(self, Self::Negotiation { .. } | Self::Timeout { .. })
    }

    /// Returns true if an identifier space is exhausted.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted(_))
    }

    /// Returns true if the key was not found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

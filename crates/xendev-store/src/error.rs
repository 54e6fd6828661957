//! Error types for store operations.

use thiserror::Error;
use xendev_error::CommonError;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur while talking to the configuration store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Shared error cases.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Path is not absolute, has empty segments or a trailing slash.
    #[error("invalid store path: {0}")]
    InvalidPath(String),

    /// Transaction was rejected as a whole.
    #[error("transaction aborted: {0}")]
    Aborted(String),
}

impl StoreError {
    /// Returns true if the transaction was rejected.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}

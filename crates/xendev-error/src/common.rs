//! Errors shared by the store, channel and controller crates.

use thiserror::Error;

/// Errors that occur across multiple xendev crates.
#[derive(Debug, Error)]
pub enum CommonError {
    /// I/O error from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation attempted in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Operation refused by the underlying resource.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Unexpected internal failure such as a poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommonError {
    /// Creates a new invalid state error.
    #[must_use]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Creates a new permission denied error.
    #[must_use]
    pub fn permission_denied(resource: impl Into<String>) -> Self {
        Self::PermissionDenied(resource.into())
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such device");
        let common_err: CommonError = io_err.into();
        assert!(matches!(common_err, CommonError::Io(_)));
        assert!(common_err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_permission_denied_error() {
        let err = CommonError::permission_denied("/local/domain/0");
        assert_eq!(err.to_string(), "permission denied: /local/domain/0");
    }

    #[test]
    fn test_invalid_state_error() {
        let err = CommonError::invalid_state("console is closed");
        assert_eq!(err.to_string(), "invalid state: console is closed");
    }

    #[test]
    fn test_internal_error() {
        let err = CommonError::internal("registry lock poisoned");
        assert_eq!(err.to_string(), "internal error: registry lock poisoned");
    }
}

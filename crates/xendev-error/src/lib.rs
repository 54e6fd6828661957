//! Common error types for xendev.
//!
//! Every xendev crate defines its own error enum for the failures specific to
//! it and wraps [`CommonError`] for the ones they all share:
//!
//! ```rust,ignore
//! use xendev_error::CommonError;
//! use thiserror::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum StoreError {
//!     #[error(transparent)]
//!     Common(#[from] CommonError),
//!
//!     #[error("malformed path: {0}")]
//!     InvalidPath(String),
//! }
//! ```

mod common;

pub use common::CommonError;

//! Store paths.

use std::fmt;

use crate::error::{Result, StoreError};

/// A validated absolute store path such as `/local/domain/3/vif/0/backend`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath(String);

impl StorePath {
    /// Parses and validates a path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidPath`] for relative paths, empty segments
    /// or a trailing slash.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate(&path)?;
        Ok(Self(path))
    }

    /// Root path of a domain.
    #[must_use]
    pub fn domain(domid: u32) -> Self {
        Self(format!("/local/domain/{domid}"))
    }

    /// Appends one or more `/`-separated segments.
    #[must_use]
    pub fn join(&self, segment: impl fmt::Display) -> Self {
        let segment = segment.to_string();
        let segment = segment.trim_matches('/');
        if segment.is_empty() {
            return self.clone();
        }
        if self.0 == "/" {
            Self(format!("/{segment}"))
        } else {
            Self(format!("{}/{segment}", self.0))
        }
    }

    /// Returns the parent path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0 == "/" {
            return None;
        }
        let idx = self.0.rfind('/')?;
        if idx == 0 {
            Some(Self("/".to_string()))
        } else {
            Some(Self(self.0[..idx].to_string()))
        }
    }

    /// Returns the last segment.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Returns the path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StorePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Checks that `path` is a well-formed absolute path.
///
/// # Errors
///
/// Returns [`StoreError::InvalidPath`] when it is not.
pub fn validate(path: &str) -> Result<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    if path[1..].split('/').any(|seg| seg.is_empty() || seg.chars().any(char::is_whitespace)) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

//! In-process configuration store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use xendev_error::CommonError;

use crate::error::{Result, StoreError};
use crate::path::validate;
use crate::transaction::{Operation, Transaction};
use crate::ConfigStore;

/// A configuration store kept in memory.
///
/// Values live in a flat ordered map keyed by absolute path; the tree shape
/// is implied by the `/` separators. A commit validates every operation before
/// applying any of them and applies them under a single write lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
    /// Subtrees that refuse writes, for exercising failure paths.
    denied: RwLock<Vec<String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later transaction touching `prefix` fail as a whole.
    pub fn deny_writes_under(&self, prefix: impl Into<String>) {
        if let Ok(mut denied) = self.denied.write() {
            denied.push(prefix.into());
        }
    }

    /// Lifts all write denials.
    pub fn allow_all_writes(&self) {
        if let Ok(mut denied) = self.denied.write() {
            denied.clear();
        }
    }

    /// Number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Returns true if the store holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_allowed(&self, path: &str) -> Result<()> {
        let denied = self.denied.read().map_err(|_| poisoned())?;
        if denied.iter().any(|prefix| is_at_or_below(path, prefix)) {
            return Err(CommonError::permission_denied(path).into());
        }
        Ok(())
    }
}

impl ConfigStore for MemoryStore {
    fn read(&self, path: &str) -> Result<Option<String>> {
        validate(path)?;
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(path).cloned())
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        validate(path)?;
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let children: BTreeSet<String> = entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| key[prefix.len()..].split('/').next())
            .map(str::to_string)
            .collect();
        Ok(children.into_iter().collect())
    }

    fn commit(&self, txn: Transaction) -> Result<()> {
        for op in txn.operations() {
            validate(op.path())?;
            self.check_allowed(op.path())
                .map_err(|e| StoreError::Aborted(e.to_string()))?;
        }

        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let count = txn.len();
        for op in txn.into_operations() {
            match op {
                Operation::Write { path, value } => {
                    entries.insert(path, value);
                }
                Operation::Remove { path } => {
                    entries.retain(|key, _| !is_at_or_below(key, &path));
                }
            }
        }
        tracing::trace!(operations = count, "store transaction committed");
        Ok(())
    }
}

fn is_at_or_below(key: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    key == prefix
        || (key.len() > prefix.len()
            && key.starts_with(prefix)
            && key.as_bytes()[prefix.len()] == b'/')
}

fn poisoned() -> StoreError {
    CommonError::internal("store lock poisoned").into()
}

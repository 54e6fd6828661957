//! # xendev-store
//!
//! Contract for the hierarchical configuration store that device descriptors
//! are published into.
//!
//! The store itself is an external collaborator: a key/value tree per domain
//! with path-scoped reads and transactional multi-key writes. This crate only
//! defines what the controllers need from it:
//!
//! - [`ConfigStore`]: reads, child listing and atomic [`Transaction`] commits
//! - [`StorePath`]: validated absolute paths
//! - [`MemoryStore`]: an in-process tree honouring the same contract
//!
//! ```text
//!   /local/domain/<domid>
//!     ├── vbd/<devid>/backend/{type,params,dev,mode}
//!     ├── vbd/<devid>/frontend/{virtual-device,device-type}
//!     ├── vif/<devid>/backend/{script,mac,bridge,handle,ip}
//!     ├── vif/<devid>/frontend/{handle,mac}
//!     └── device-misc/<class>/nextDeviceID
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod memory;
pub mod path;
pub mod transaction;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use path::StorePath;
pub use transaction::{Operation, Transaction};

/// Hierarchical key/value store shared with guest-side drivers.
///
/// Implementations must apply a committed [`Transaction`] atomically: readers
/// observe either none or all of its operations.
pub trait ConfigStore: Send + Sync {
    /// Reads the value stored at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is malformed or the store is unreachable.
    fn read(&self, path: &str) -> Result<Option<String>>;

    /// Lists the names of the immediate children of `path`, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is malformed or the store is unreachable.
    fn list(&self, path: &str) -> Result<Vec<String>>;

    /// Applies every operation of `txn` atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if any operation is rejected; in that case none of
    /// them has been applied.
    fn commit(&self, txn: Transaction) -> Result<()>;

    /// Returns whether `path` holds a value or has children.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is malformed or the store is unreachable.
    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.read(path)?.is_some() || !self.list(path)?.is_empty())
    }

    /// Writes a single value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write is rejected.
    fn write(&self, path: &str, value: &str) -> Result<()> {
        let mut txn = Transaction::new();
        txn.write(path, value);
        self.commit(txn)
    }

    /// Removes `path` and everything below it.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal is rejected.
    fn remove(&self, path: &str) -> Result<()> {
        let mut txn = Transaction::new();
        txn.remove(path);
        self.commit(txn)
    }
}

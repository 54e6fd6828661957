//! Transactional multi-key writes.

use std::collections::BTreeMap;

/// One operation inside a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Sets `path` to `value`.
    Write { path: String, value: String },
    /// Removes `path` and its whole subtree.
    Remove { path: String },
}

impl Operation {
    /// Path the operation touches.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Write { path, .. } | Self::Remove { path } => path,
        }
    }
}

/// An ordered batch of operations that a [`ConfigStore`](crate::ConfigStore)
/// applies all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    ops: Vec<Operation>,
}

impl Transaction {
    /// Creates an empty transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a write.
    pub fn write(&mut self, path: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(Operation::Write {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    /// Queues one write per entry of `values`, each below `dir`.
    pub fn write_all(&mut self, dir: &str, values: &BTreeMap<String, String>) -> &mut Self {
        for (key, value) in values {
            self.write(format!("{dir}/{key}"), value.clone());
        }
        self
    }

    /// Queues removal of a subtree.
    pub fn remove(&mut self, path: impl Into<String>) -> &mut Self {
        self.ops.push(Operation::Remove { path: path.into() });
        self
    }

    /// Returns the queued operations in order.
    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }

    /// Consumes the transaction, returning its operations.
    #[must_use]
    pub fn into_operations(self) -> Vec<Operation> {
        self.ops
    }

    /// Returns true if nothing has been queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_all_prefixes_keys() {
        let mut values = BTreeMap::new();
        values.insert("handle".to_string(), "0".to_string());
        values.insert("mac".to_string(), "00:16:3e:00:00:01".to_string());

        let mut txn = Transaction::new();
        txn.write_all("/local/domain/1/vif/0/frontend", &values);

        let paths: Vec<&str> = txn.operations().iter().map(Operation::path).collect();
        assert_eq!(
            paths,
            vec![
                "/local/domain/1/vif/0/frontend/handle",
                "/local/domain/1/vif/0/frontend/mac",
            ]
        );
    }

    #[test]
    fn test_operations_keep_order() {
        let mut txn = Transaction::new();
        txn.remove("/a").write("/a/b", "1");
        assert_eq!(txn.len(), 2);
        assert!(matches!(txn.operations()[0], Operation::Remove { .. }));
        assert!(matches!(txn.operations()[1], Operation::Write { .. }));
    }
}

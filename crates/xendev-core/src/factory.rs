//! Generic controller registry.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::controller::{Controller, InstanceKey};
use crate::error::{CoreError, Result};

/// Registry of live controller instances, keyed by [`InstanceKey`].
#[derive(Debug)]
pub struct ControllerFactory<C> {
    kind: &'static str,
    instances: HashMap<InstanceKey, C>,
}

impl<C: Controller> ControllerFactory<C> {
    /// Creates an empty registry; `kind` names the controllers in logs.
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            instances: HashMap::new(),
        }
    }

    /// Registers a new instance and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadyExists`] if an instance is already
    /// registered under the same key; the existing one is left untouched.
    pub fn create_instance(&mut self, controller: C) -> Result<&mut C> {
        let key = controller.key();
        match self.instances.entry(key) {
            Entry::Occupied(_) => Err(CoreError::AlreadyExists(format!(
                "{} controller {key}",
                self.kind
            ))),
            Entry::Vacant(slot) => {
                tracing::debug!(kind = self.kind, %key, "controller registered");
                Ok(slot.insert(controller))
            }
        }
    }

    /// Looks up an instance.
    #[must_use]
    pub fn lookup(&self, key: InstanceKey) -> Option<&C> {
        self.instances.get(&key)
    }

    /// Looks up an instance for mutation.
    pub fn lookup_mut(&mut self, key: InstanceKey) -> Option<&mut C> {
        self.instances.get_mut(&key)
    }

    /// Deregisters an instance. Removing an absent key is a no-op.
    pub fn remove_instance(&mut self, key: InstanceKey) -> Option<C> {
        let removed = self.instances.remove(&key);
        if removed.is_some() {
            tracing::debug!(kind = self.kind, %key, "controller removed");
        }
        removed
    }

    /// Registered keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<InstanceKey> {
        let mut keys: Vec<InstanceKey> = self.instances.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Iterates over registered instances in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &C> {
        self.instances.values()
    }

    /// Removes and returns every instance.
    pub fn drain(&mut self) -> Vec<C> {
        self.instances.drain().map(|(_, controller)| controller).collect()
    }

    /// Number of registered instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Dispatch;
    use xendev_channel::{Channel, MajorType, Message};

    #[derive(Debug)]
    struct Stub {
        key: InstanceKey,
        tag: &'static str,
    }

    impl Controller for Stub {
        fn key(&self) -> InstanceKey {
            self.key
        }

        fn major_types(&self) -> &[MajorType] {
            &[]
        }

        fn is_closed(&self) -> bool {
            false
        }

        fn channel_mut(&mut self) -> Option<&mut Box<dyn Channel>> {
            None
        }

        fn handle_request(&mut self, _msg: &Message) -> Dispatch {
            Dispatch::Unrecognized
        }

        fn lost_channel(&mut self) {}
    }

    #[test]
    fn test_create_rejects_duplicate_key() {
        let mut factory = ControllerFactory::new("stub");
        let key = InstanceKey::domain(1);
        factory.create_instance(Stub { key, tag: "first" }).unwrap();

        let err = factory
            .create_instance(Stub { key, tag: "second" })
            .unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists(_)));
        assert_eq!(factory.lookup(key).unwrap().tag, "first");
        assert_eq!(factory.len(), 1);
    }

    #[test]
    fn test_device_keys_are_distinct_from_domain_keys() {
        let mut factory = ControllerFactory::new("stub");
        factory
            .create_instance(Stub {
                key: InstanceKey::domain(2),
                tag: "domain",
            })
            .unwrap();
        factory
            .create_instance(Stub {
                key: InstanceKey::device(2, 0),
                tag: "device",
            })
            .unwrap();
        assert_eq!(
            factory.keys(),
            vec![InstanceKey::domain(2), InstanceKey::device(2, 0)]
        );
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut factory = ControllerFactory::new("stub");
        let key = InstanceKey::domain(5);
        factory.create_instance(Stub { key, tag: "x" }).unwrap();

        assert!(factory.remove_instance(key).is_some());
        assert!(factory.remove_instance(key).is_none());
        assert!(factory.lookup(key).is_none());
        assert!(factory.is_empty());
    }
}

//! Device controllers.
//!
//! A device controller turns a [`DeviceRequest`] into a pair of descriptors
//! and publishes both in one store transaction:
//!
//! ```text
//!   DeviceRequest ──device_details──▶ DeviceDetails { backend, frontend }
//!                                          │
//!                                          ▼  one Transaction
//!   /local/domain/<domid>/<class>/<devid>/backend/<key>  = value
//!   /local/domain/<domid>/<class>/<devid>/frontend/<key> = value
//! ```
//!
//! Device ids come from a per-class counter kept in the store under
//! `device-misc/<class>/nextDeviceID` and are never handed out twice.

pub mod blktap;
pub mod block;
pub mod manager;
pub mod net;
pub mod phantom;
pub mod tapdisk;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use xendev_error::CommonError;
use xendev_store::{ConfigStore, StorePath, Transaction};

use crate::config::Settings;
use crate::error::{CoreError, Result};

pub use blktap::{BackingSpec, BlktapController, PhantomDevice, PhantomHost};
pub use block::BlockController;
pub use manager::{DeviceManager, PrivilegedDomain};
pub use net::NetController;
pub use phantom::PhantomAllocator;
pub use tapdisk::{TapDevice, TapdiskHelper};

/// Device category; also the store directory descriptors live under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Block device.
    Vbd,
    /// Block device served by the tap driver.
    Tap,
    /// Network interface.
    Vif,
}

impl DeviceClass {
    /// Store directory name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Vbd => "vbd",
            Self::Tap => "tap",
            Self::Vif => "vif",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceClass {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vbd" => Ok(Self::Vbd),
            "tap" => Ok(Self::Tap),
            "vif" => Ok(Self::Vif),
            other => Err(CoreError::validation(format!("unknown device class {other}"))),
        }
    }
}

/// Device identifier, unique per domain and class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Creates a new device id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of guest a device is attached to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    /// Paravirtualized guest.
    #[default]
    Pv,
    /// Fully virtualized guest behind an emulated device model.
    Hvm,
}

/// One value of a [`DeviceRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Plain string.
    Str(String),
    /// Ordered list, e.g. IP addresses.
    List(Vec<String>),
    /// Nested record.
    Record(DeviceRequest),
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<String>> for ConfigValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

impl From<Vec<&str>> for ConfigValue {
    fn from(value: Vec<&str>) -> Self {
        Self::List(value.into_iter().map(ToString::to_string).collect())
    }
}

impl From<DeviceRequest> for ConfigValue {
    fn from(value: DeviceRequest) -> Self {
        Self::Record(value)
    }
}

/// String-keyed device creation record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceRequest(BTreeMap<String, ConfigValue>);

impl DeviceRequest {
    /// Creates an empty request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Sets `key`, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Raw value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.0.get(key)
    }

    /// String value of `key`; lists and records yield `None`.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(ConfigValue::Str(value)) => Some(value),
            _ => None,
        }
    }

    /// List value of `key`. A string is split on whitespace.
    #[must_use]
    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(ConfigValue::Str(value)) => value.split_whitespace().map(ToString::to_string).collect(),
            Some(ConfigValue::List(values)) => values.clone(),
            Some(ConfigValue::Record(_)) | None => Vec::new(),
        }
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigValue)> {
        self.0.iter()
    }
}

/// A published key/value record.
pub type Descriptor = BTreeMap<String, String>;

/// Backend and frontend descriptors of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDetails {
    pub devid: DeviceId,
    pub backend: Descriptor,
    pub frontend: Descriptor,
}

impl DeviceDetails {
    /// Creates empty descriptors for `devid`.
    #[must_use]
    pub const fn new(devid: DeviceId) -> Self {
        Self {
            devid,
            backend: BTreeMap::new(),
            frontend: BTreeMap::new(),
        }
    }
}

/// Where a created device was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CreatedDevice {
    pub class: DeviceClass,
    pub devid: DeviceId,
}

/// Which half of a descriptor pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Backend,
    Frontend,
}

impl Side {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Frontend => "frontend",
        }
    }
}

/// Everything a controller needs to know about the domain it serves.
#[derive(Clone)]
pub struct DeviceContext {
    domid: u32,
    image: ImageKind,
    store: Arc<dyn ConfigStore>,
    settings: Arc<Settings>,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("domid", &self.domid)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

impl DeviceContext {
    /// Creates a context for `domid`.
    #[must_use]
    pub fn new(domid: u32, image: ImageKind, store: Arc<dyn ConfigStore>, settings: Arc<Settings>) -> Self {
        Self {
            domid,
            image,
            store,
            settings,
        }
    }

    /// Domain id.
    #[must_use]
    pub const fn domid(&self) -> u32 {
        self.domid
    }

    /// Guest kind.
    #[must_use]
    pub const fn image(&self) -> ImageKind {
        self.image
    }

    /// Settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Store handle.
    #[must_use]
    pub fn store(&self) -> &dyn ConfigStore {
        self.store.as_ref()
    }

    /// `<root>/<class>/<devid>`.
    #[must_use]
    pub fn device_path(&self, class: DeviceClass, devid: DeviceId) -> StorePath {
        StorePath::domain(self.domid).join(class).join(devid)
    }

    /// `<root>/<class>/<devid>/<side>`.
    #[must_use]
    pub fn descriptor_path(&self, class: DeviceClass, devid: DeviceId, side: Side) -> StorePath {
        self.device_path(class, devid).join(side.as_str())
    }

    /// Hands out the next id for `class`.
    ///
    /// The counter is bumped in the store immediately so the id is never
    /// reused, even if creation later fails. Ids whose directory still
    /// exists are skipped.
    ///
    /// # Errors
    ///
    /// Fails if the store is unreachable, the counter is corrupt or the id
    /// space is used up.
    pub fn allocate_device_id(&self, class: DeviceClass) -> Result<DeviceId> {
        let counter = StorePath::domain(self.domid)
            .join("device-misc")
            .join(class)
            .join("nextDeviceID");
        let mut next = match self.store.read(counter.as_str())? {
            Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
                CoreError::from(CommonError::internal(format!("corrupt device counter {counter}: {raw}")))
            })?,
            None => 0,
        };
        while self.store.exists(self.device_path(class, DeviceId(next)).as_str())? {
            next = next
                .checked_add(1)
                .ok_or_else(|| CoreError::Exhausted(format!("{class} device ids")))?;
        }
        let after = next
            .checked_add(1)
            .ok_or_else(|| CoreError::Exhausted(format!("{class} device ids")))?;
        self.store.write(counter.as_str(), &after.to_string())?;
        tracing::debug!(domid = self.domid, %class, devid = next, "device id allocated");
        Ok(DeviceId(next))
    }

    /// Writes both descriptors in a single transaction.
    ///
    /// # Errors
    ///
    /// Fails if the store rejects the transaction; nothing is written then.
    pub fn publish(&self, class: DeviceClass, details: &DeviceDetails) -> Result<()> {
        let mut txn = Transaction::new();
        txn.write_all(
            self.descriptor_path(class, details.devid, Side::Backend).as_str(),
            &details.backend,
        );
        txn.write_all(
            self.descriptor_path(class, details.devid, Side::Frontend).as_str(),
            &details.frontend,
        );
        self.store.commit(txn)?;
        tracing::info!(domid = self.domid, %class, devid = %details.devid, "device published");
        Ok(())
    }

    /// Reads one published descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if nothing is published there.
    pub fn read_descriptor(&self, class: DeviceClass, devid: DeviceId, side: Side) -> Result<Descriptor> {
        let dir = self.descriptor_path(class, devid, side);
        let keys = self.store.list(dir.as_str())?;
        if keys.is_empty() {
            return Err(CoreError::NotFound(format!(
                "{class} device {devid} of domain {}",
                self.domid
            )));
        }
        let mut descriptor = Descriptor::new();
        for key in keys {
            if let Some(value) = self.store.read(dir.join(&key).as_str())? {
                descriptor.insert(key, value);
            }
        }
        Ok(descriptor)
    }

    /// Atomically removes both descriptors of a device.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if the device is not published.
    pub fn remove_device(&self, class: DeviceClass, devid: DeviceId) -> Result<()> {
        let path = self.device_path(class, devid);
        if !self.store.exists(path.as_str())? {
            return Err(CoreError::NotFound(format!(
                "{class} device {devid} of domain {}",
                self.domid
            )));
        }
        let mut txn = Transaction::new();
        txn.remove(path.as_str());
        self.store.commit(txn)?;
        tracing::info!(domid = self.domid, %class, %devid, "device removed");
        Ok(())
    }

    /// Published device ids of `class`, ascending.
    ///
    /// # Errors
    ///
    /// Fails if the store is unreachable.
    pub fn list_devices(&self, class: DeviceClass) -> Result<Vec<DeviceId>> {
        let dir = StorePath::domain(self.domid).join(class);
        let mut ids: Vec<DeviceId> = self
            .store
            .list(dir.as_str())?
            .iter()
            .filter_map(|name| name.parse().ok().map(DeviceId))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

/// Contract shared by every device class.
#[async_trait]
pub trait DeviceController: Send + Sync {
    /// Class descriptors are published under.
    fn class(&self) -> DeviceClass;

    /// Builds the descriptors of device `devid` from `request`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed requests.
    async fn device_details(
        &self,
        ctx: &DeviceContext,
        devid: DeviceId,
        request: &DeviceRequest,
    ) -> Result<DeviceDetails>;

    /// Allocates an id, builds the descriptors and publishes them.
    ///
    /// # Errors
    ///
    /// Fails if the request is invalid or the store rejects the descriptors;
    /// no descriptor is left behind in either case.
    async fn create_device(&self, ctx: &DeviceContext, request: &DeviceRequest) -> Result<CreatedDevice> {
        let class = self.class();
        let devid = ctx.allocate_device_id(class)?;
        let details = self.device_details(ctx, devid, request).await?;
        ctx.publish(class, &details)?;
        Ok(CreatedDevice { class, devid })
    }

    /// Reads a published device back as a request record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if the device is not published.
    fn configuration(&self, ctx: &DeviceContext, devid: DeviceId) -> Result<DeviceRequest>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use xendev_store::MemoryStore;

    pub(crate) fn context(domid: u32, image: ImageKind) -> (DeviceContext, Arc<MemoryStore>) {
        context_with(domid, image, Settings::default())
    }

    pub(crate) fn context_with(
        domid: u32,
        image: ImageKind,
        settings: Settings,
    ) -> (DeviceContext, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ctx = DeviceContext::new(domid, image, store.clone(), Arc::new(settings));
        (ctx, store)
    }

    #[test]
    fn test_device_class_names() {
        assert_eq!(DeviceClass::Vbd.to_string(), "vbd");
        assert_eq!("vif".parse::<DeviceClass>().unwrap(), DeviceClass::Vif);
        assert!("usb".parse::<DeviceClass>().unwrap_err().is_validation());
    }

    #[test]
    fn test_request_accessors() {
        let request = DeviceRequest::new()
            .with("mac", "00:16:3e:00:00:01")
            .with("ip", vec!["10.0.0.1", "10.0.0.2"])
            .with("legacy_ip", "10.0.0.3 10.0.0.4");
        assert_eq!(request.get_str("mac"), Some("00:16:3e:00:00:01"));
        assert_eq!(request.get_str("ip"), None);
        assert_eq!(request.get_list("ip"), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(request.get_list("legacy_ip"), vec!["10.0.0.3", "10.0.0.4"]);
        assert!(request.get_list("missing").is_empty());
    }

    #[test]
    fn test_request_deserializes_nested_values() {
        let request: DeviceRequest = serde_json::from_value(serde_json::json!({
            "uname": "tap:aio:/images/disk.img",
            "ip": ["10.0.0.5"],
            "extra": { "key": "value" }
        }))
        .unwrap();
        assert_eq!(request.get_str("uname"), Some("tap:aio:/images/disk.img"));
        assert_eq!(request.get_list("ip"), vec!["10.0.0.5"]);
        assert!(matches!(request.get("extra"), Some(ConfigValue::Record(_))));
    }

    #[test]
    fn test_allocate_ids_monotonic() {
        let (ctx, _store) = context(1, ImageKind::Pv);
        let ids: Vec<u32> = (0..4)
            .map(|_| ctx.allocate_device_id(DeviceClass::Vif).unwrap().raw())
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(ctx.allocate_device_id(DeviceClass::Vbd).unwrap().raw(), 0);
    }

    #[test]
    fn test_allocate_skips_published_ids() {
        let (ctx, store) = context(2, ImageKind::Pv);
        store.write("/local/domain/2/vbd/0/backend/mode", "r").unwrap();
        store.write("/local/domain/2/vbd/1/backend/mode", "r").unwrap();
        assert_eq!(ctx.allocate_device_id(DeviceClass::Vbd).unwrap().raw(), 2);
        assert_eq!(
            store.read("/local/domain/2/device-misc/vbd/nextDeviceID").unwrap().as_deref(),
            Some("3")
        );
    }

    #[test]
    fn test_corrupt_counter_reported() {
        let (ctx, store) = context(3, ImageKind::Pv);
        store.write("/local/domain/3/device-misc/vif/nextDeviceID", "lots").unwrap();
        assert!(ctx.allocate_device_id(DeviceClass::Vif).is_err());
    }

    #[test]
    fn test_publish_and_read_back() {
        let (ctx, _store) = context(4, ImageKind::Pv);
        let mut details = DeviceDetails::new(DeviceId::new(0));
        details.backend.insert("mode".into(), "w".into());
        details.frontend.insert("device-type".into(), "disk".into());
        ctx.publish(DeviceClass::Vbd, &details).unwrap();

        let backend = ctx
            .read_descriptor(DeviceClass::Vbd, DeviceId::new(0), Side::Backend)
            .unwrap();
        assert_eq!(backend, details.backend);
        assert_eq!(ctx.list_devices(DeviceClass::Vbd).unwrap(), vec![DeviceId::new(0)]);
    }

    #[test]
    fn test_publish_is_atomic() {
        let (ctx, store) = context(5, ImageKind::Pv);
        store.deny_writes_under("/local/domain/5/vbd/0/frontend");
        let mut details = DeviceDetails::new(DeviceId::new(0));
        details.backend.insert("mode".into(), "w".into());
        details.frontend.insert("device-type".into(), "disk".into());

        assert!(ctx.publish(DeviceClass::Vbd, &details).is_err());
        assert!(!store.exists("/local/domain/5/vbd/0").unwrap());
    }

    #[test]
    fn test_remove_device() {
        let (ctx, store) = context(6, ImageKind::Pv);
        let mut details = DeviceDetails::new(DeviceId::new(3));
        details.backend.insert("handle".into(), "3".into());
        details.frontend.insert("handle".into(), "3".into());
        ctx.publish(DeviceClass::Vif, &details).unwrap();

        ctx.remove_device(DeviceClass::Vif, DeviceId::new(3)).unwrap();
        assert!(!store.exists("/local/domain/6/vif/3").unwrap());
        assert!(ctx.remove_device(DeviceClass::Vif, DeviceId::new(3)).unwrap_err().is_not_found());
    }
}

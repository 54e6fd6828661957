//! Per-domain device management.
//!
//! A [`DeviceManager`] routes requests to the controller for a device class
//! and announces results on the [`EventBus`]. The [`PrivilegedDomain`] wraps
//! the manager of domain 0 together with the phantom name allocator, and is
//! handed to guest managers as their [`PhantomHost`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use xendev_error::CommonError;
use xendev_store::ConfigStore;

use crate::config::Settings;
use crate::device::blktap::{BlktapController, PhantomDevice, PhantomHost};
use crate::device::block::BlockController;
use crate::device::net::NetController;
use crate::device::phantom::PhantomAllocator;
use crate::device::{
    CreatedDevice, DeviceClass, DeviceContext, DeviceController, DeviceId, DeviceRequest,
    ImageKind, Side,
};
use crate::error::Result;
use crate::event::{Event, EventBus};

/// Device controllers of one domain.
pub struct DeviceManager {
    ctx: DeviceContext,
    block: BlockController,
    blktap: BlktapController,
    net: NetController,
    phantoms: Option<Arc<dyn PhantomHost>>,
    events: EventBus,
}

impl fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceManager")
            .field("ctx", &self.ctx)
            .field("blktap", &self.blktap)
            .field("net", &self.net)
            .field("phantoms", &self.phantoms.is_some())
            .finish_non_exhaustive()
    }
}

impl DeviceManager {
    /// Creates the manager of `domid`.
    ///
    /// # Errors
    ///
    /// Fails if the tap helper settings are unusable.
    pub fn new(
        domid: u32,
        image: ImageKind,
        store: Arc<dyn ConfigStore>,
        settings: Arc<Settings>,
        phantoms: Option<Arc<dyn PhantomHost>>,
        events: EventBus,
    ) -> Result<Self> {
        let blktap = BlktapController::new(&settings.blktap, phantoms.clone())?;
        let net = NetController::new(settings.network.clone());
        Ok(Self {
            ctx: DeviceContext::new(domid, image, store, settings),
            block: BlockController::vbd(),
            blktap,
            net,
            phantoms,
            events,
        })
    }

    /// Domain id.
    #[must_use]
    pub const fn domid(&self) -> u32 {
        self.ctx.domid()
    }

    /// Shared controller context.
    #[must_use]
    pub const fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    /// Controller handling requests for `class`.
    fn controller(&self, class: DeviceClass) -> &dyn DeviceController {
        match class {
            DeviceClass::Vbd => &self.block,
            DeviceClass::Tap => &self.blktap,
            DeviceClass::Vif => &self.net,
        }
    }

    /// Creates a device of `class`.
    ///
    /// Tap requests may end up published as `vbd`; the returned
    /// [`CreatedDevice`] says where.
    ///
    /// # Errors
    ///
    /// Propagates validation, negotiation, exhaustion and store errors.
    pub async fn create_device(&self, class: DeviceClass, request: &DeviceRequest) -> Result<CreatedDevice> {
        let created = match self.controller(class).create_device(&self.ctx, request).await {
            Ok(created) => created,
            Err(e) => {
                tracing::warn!(domid = self.domid(), %class, error = %e, "device creation failed");
                return Err(e);
            }
        };
        self.events.publish(Event::DeviceCreated {
            domid: self.domid(),
            class: created.class,
            devid: created.devid,
        });
        Ok(created)
    }

    /// Reads a published device back as a request record.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if nothing is published.
    pub fn configuration(&self, class: DeviceClass, devid: DeviceId) -> Result<DeviceRequest> {
        self.controller(class).configuration(&self.ctx, devid)
    }

    /// Removes both descriptors of a device, and its phantom device if it
    /// has one.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if nothing is published.
    pub async fn destroy_device(&self, class: DeviceClass, devid: DeviceId) -> Result<()> {
        let phantom = match class {
            DeviceClass::Vbd | DeviceClass::Tap => self
                .ctx
                .read_descriptor(class, devid, Side::Frontend)
                .ok()
                .and_then(|frontend| frontend.get("phantom_vbd").cloned()),
            DeviceClass::Vif => None,
        };
        self.ctx.remove_device(class, devid)?;
        self.events.publish(Event::DeviceDestroyed {
            domid: self.domid(),
            class,
            devid,
        });

        if let (Some(path), Some(host)) = (phantom, self.phantoms.as_ref()) {
            if let Err(e) = host.destroy_phantom(&path).await {
                tracing::warn!(domid = self.domid(), %path, error = %e, "phantom teardown failed");
            }
        }
        Ok(())
    }

    /// Published devices of `class`.
    ///
    /// # Errors
    ///
    /// Fails if the store is unreachable.
    pub fn list_devices(&self, class: DeviceClass) -> Result<Vec<DeviceId>> {
        self.ctx.list_devices(class)
    }
}

/// Domain 0: its device manager plus the phantom devices it hosts.
#[derive(Debug)]
pub struct PrivilegedDomain {
    manager: DeviceManager,
    allocator: Mutex<PhantomAllocator>,
    live: Mutex<HashMap<String, PhantomDevice>>,
}

impl PrivilegedDomain {
    /// Creates domain 0.
    ///
    /// # Errors
    ///
    /// Fails if the tap helper settings are unusable.
    pub fn new(store: Arc<dyn ConfigStore>, settings: Arc<Settings>, events: EventBus) -> Result<Arc<Self>> {
        let manager = DeviceManager::new(0, ImageKind::Pv, store, settings, None, events)?;
        Ok(Arc::new(Self {
            manager,
            allocator: Mutex::new(PhantomAllocator::new()),
            live: Mutex::new(HashMap::new()),
        }))
    }

    /// Device manager of domain 0.
    #[must_use]
    pub const fn manager(&self) -> &DeviceManager {
        &self.manager
    }

    /// Manager for guest `domid`, using this domain for phantom devices.
    ///
    /// # Errors
    ///
    /// Fails if the tap helper settings are unusable.
    pub fn guest_manager(self: &Arc<Self>, domid: u32, image: ImageKind) -> Result<DeviceManager> {
        let ctx = self.manager.context();
        let host: Arc<dyn PhantomHost> = self.clone();
        DeviceManager::new(
            domid,
            image,
            ctx.store.clone(),
            ctx.settings.clone(),
            Some(host),
            self.manager.events.clone(),
        )
    }

    /// Live phantom devices, by backend path.
    #[must_use]
    pub fn phantoms(&self) -> Vec<PhantomDevice> {
        lock(&self.live)
            .map(|live| live.values().cloned().collect())
            .unwrap_or_default()
    }

    fn release_name(&self, name: &str) -> Result<()> {
        lock(&self.allocator)?.release(name);
        Ok(())
    }
}

#[async_trait]
impl PhantomHost for PrivilegedDomain {
    async fn create_phantom(&self, uname: &str) -> Result<PhantomDevice> {
        let dev_dir = self.manager.context().settings().blktap.dev_dir.clone();
        let name = lock(&self.allocator)?.allocate(&dev_dir)?;

        let request = DeviceRequest::new()
            .with("dev", name.as_str())
            .with("mode", "w")
            .with("uname", uname);
        let created = match self.manager.create_device(DeviceClass::Tap, &request).await {
            Ok(created) => created,
            Err(e) => {
                self.release_name(&name)?;
                return Err(e);
            }
        };

        let backend_path = self
            .manager
            .context()
            .descriptor_path(created.class, created.devid, Side::Backend);
        let phantom = PhantomDevice {
            name,
            created,
            backend_path,
        };
        tracing::info!(name = %phantom.name, backend = %phantom.backend_path, "phantom device created");
        lock(&self.live)?.insert(phantom.backend_path.to_string(), phantom.clone());
        Ok(phantom)
    }

    async fn destroy_phantom(&self, backend_path: &str) -> Result<()> {
        let Some(phantom) = lock(&self.live)?.remove(backend_path) else {
            return Ok(());
        };
        let result = self
            .manager
            .destroy_device(phantom.created.class, phantom.created.devid)
            .await;
        self.release_name(&phantom.name)?;
        tracing::info!(name = %phantom.name, "phantom device destroyed");
        result
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| CommonError::internal("phantom state lock poisoned").into())
}

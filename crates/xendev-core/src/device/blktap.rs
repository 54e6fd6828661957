//! Block devices behind the blktap2 driver.
//!
//! ```text
//!   uname "tap:<format>:<path>"  or  "tap:<driver>:<format>:<path>"
//!        │
//!        ├── legacy format or no blktap2 driver ──▶ BlockController (class tap)
//!        │
//!        └── tapdisk2 -n <format>:<path> ──▶ /dev/xen/blktap-2/tapdevN
//!                 │
//!                 └── uname "phy:/dev/xen/blktap-2/tapdevN" ──▶ BlockController (class vbd)
//! ```
//!
//! HVM guests additionally get a phantom device in the privileged domain
//! backed by the same image; the primary frontend points at it through
//! `phantom_vbd`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use xendev_store::StorePath;

use crate::config::BlktapSettings;
use crate::device::block::BlockController;
use crate::device::tapdisk::TapdiskHelper;
use crate::device::{
    CreatedDevice, DeviceClass, DeviceContext, DeviceController, DeviceDetails, DeviceId,
    DeviceRequest, ImageKind,
};
use crate::error::{CoreError, Result};

/// Image formats the tap driver understands.
pub const BLKTAP_FORMATS: [&str; 9] = [
    "aio", "sync", "vmdk", "ram", "qcow", "qcow2", "vhd", "ioemu", "tapdisk",
];

const DEFAULT_DRIVER: &str = "tapdisk";

/// A parsed `uname` of a tap device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingSpec {
    /// Leading type, usually `tap` or `tap2`.
    pub kind: String,
    /// Driver, `tapdisk` unless given.
    pub driver: String,
    /// Image format.
    pub format: String,
    /// Image path.
    pub path: String,
}

impl BackingSpec {
    /// Parses `type:[driver:]format:path`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for fewer than three fields, empty fields
    /// or an unknown format.
    pub fn parse(uname: &str) -> Result<Self> {
        let fields: Vec<&str> = uname.splitn(4, ':').collect();
        let (kind, driver, format, path) = match fields.as_slice() {
            [kind, driver, format, path] => (*kind, *driver, *format, *path),
            [kind, format, path] => (*kind, DEFAULT_DRIVER, *format, *path),
            _ => {
                return Err(CoreError::validation(format!(
                    "malformed tap uname {uname}"
                )))
            }
        };
        if [kind, driver, format, path].iter().any(|f| f.is_empty()) {
            return Err(CoreError::validation(format!("malformed tap uname {uname}")));
        }
        if !BLKTAP_FORMATS.contains(&format) {
            return Err(CoreError::validation(format!(
                "unsupported tap image format {format}"
            )));
        }
        Ok(Self {
            kind: kind.to_string(),
            driver: driver.to_string(),
            format: format.to_string(),
            path: path.to_string(),
        })
    }

    /// Returns true if this format must go through the legacy driver.
    #[must_use]
    pub fn wants_legacy(&self, legacy_formats: &[String]) -> bool {
        self.kind == "tap"
            && self.driver == DEFAULT_DRIVER
            && legacy_formats.iter().any(|f| *f == self.format)
    }
}

/// A phantom device created in the privileged domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhantomDevice {
    /// Device name, e.g. `xvdc1`.
    pub name: String,
    /// Where it was published in domain 0.
    pub created: CreatedDevice,
    /// Its backend directory, referenced as `phantom_vbd`.
    pub backend_path: StorePath,
}

/// Creates and destroys phantom devices; implemented by the privileged
/// domain.
#[async_trait]
pub trait PhantomHost: Send + Sync {
    /// Creates a writable phantom device backed by the image in `uname`.
    ///
    /// # Errors
    ///
    /// Fails if no name is free or the device cannot be created.
    async fn create_phantom(&self, uname: &str) -> Result<PhantomDevice>;

    /// Destroys the phantom device whose backend lives at `backend_path`.
    /// Unknown paths are ignored.
    ///
    /// # Errors
    ///
    /// Fails if the descriptors cannot be removed.
    async fn destroy_phantom(&self, backend_path: &str) -> Result<()>;
}

/// Tap device controller.
pub struct BlktapController {
    settings: BlktapSettings,
    helper: TapdiskHelper,
    legacy: BlockController,
    block: BlockController,
    phantoms: Option<Arc<dyn PhantomHost>>,
}

impl std::fmt::Debug for BlktapController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlktapController")
            .field("helper", &self.helper)
            .field("phantoms", &self.phantoms.is_some())
            .finish_non_exhaustive()
    }
}

impl BlktapController {
    /// Creates a controller; `phantoms` is required for HVM guests.
    ///
    /// # Errors
    ///
    /// Fails if the helper settings are unusable.
    pub fn new(settings: &BlktapSettings, phantoms: Option<Arc<dyn PhantomHost>>) -> Result<Self> {
        Ok(Self {
            settings: settings.clone(),
            helper: TapdiskHelper::new(settings)?,
            legacy: BlockController::tap(),
            block: BlockController::vbd(),
            phantoms,
        })
    }

    async fn blktap2_loaded(&self) -> Result<bool> {
        driver_listed(&self.settings.proc_devices).await
    }

    /// Phantom host to use for a device of `ctx`: none for PV guests, and
    /// an error for HVM guests when no privileged domain was supplied.
    fn phantom_host(&self, ctx: &DeviceContext) -> Result<Option<&Arc<dyn PhantomHost>>> {
        if ctx.image() != ImageKind::Hvm {
            return Ok(None);
        }
        self.phantoms.as_ref().map(Some).ok_or_else(|| {
            CoreError::validation("HVM tap devices need a privileged domain for phantom devices")
        })
    }

    /// Allocates the id, links the phantom device if any and publishes.
    /// The phantom is destroyed again if publishing fails.
    async fn publish_device(
        &self,
        ctx: &DeviceContext,
        target: &BlockController,
        request: &DeviceRequest,
        uname: &str,
        host: Option<&Arc<dyn PhantomHost>>,
    ) -> Result<CreatedDevice> {
        let class = target.class();
        let devid = ctx.allocate_device_id(class)?;
        let mut details = target.details(devid, request)?;

        let Some(host) = host else {
            ctx.publish(class, &details)?;
            return Ok(CreatedDevice { class, devid });
        };
        let phantom = host.create_phantom(uname).await?;
        details
            .frontend
            .insert("phantom_vbd".into(), phantom.backend_path.to_string());
        if let Err(e) = ctx.publish(class, &details) {
            if let Err(cleanup) = host.destroy_phantom(phantom.backend_path.as_str()).await {
                tracing::warn!(name = %phantom.name, error = %cleanup, "phantom cleanup failed");
            }
            return Err(e);
        }
        Ok(CreatedDevice { class, devid })
    }
}

#[async_trait]
impl DeviceController for BlktapController {
    fn class(&self) -> DeviceClass {
        DeviceClass::Tap
    }

    /// Descriptors of a legacy tap device. Phantom devices are only linked
    /// by [`DeviceController::create_device`].
    async fn device_details(
        &self,
        _ctx: &DeviceContext,
        devid: DeviceId,
        request: &DeviceRequest,
    ) -> Result<DeviceDetails> {
        self.legacy.details(devid, request)
    }

    async fn create_device(&self, ctx: &DeviceContext, request: &DeviceRequest) -> Result<CreatedDevice> {
        let uname = request
            .get_str("uname")
            .ok_or_else(|| CoreError::validation("tap device needs a uname"))?;
        let spec = BackingSpec::parse(uname)?;
        self.legacy.details(DeviceId::new(0), request)?;
        let host = self.phantom_host(ctx)?;

        let legacy = spec.wants_legacy(&self.settings.legacy_formats) || !self.blktap2_loaded().await?;
        if legacy {
            tracing::warn!(domid = ctx.domid(), %uname, "using deprecated blktap driver");
            return self.publish_device(ctx, &self.legacy, request, uname, host).await;
        }

        let tap = self.helper.negotiate(&spec.format, &spec.path).await?;
        let mut rewritten = request.clone();
        rewritten.insert("uname", format!("phy:{}", tap.device));
        let result = self.publish_device(ctx, &self.block, &rewritten, uname, host).await;
        if result.is_err() {
            if let Err(e) = self.helper.release(&tap).await {
                tracing::warn!(device = %tap.device, error = %e, "tap device release failed");
            }
        }
        result
    }

    fn configuration(&self, ctx: &DeviceContext, devid: DeviceId) -> Result<DeviceRequest> {
        self.legacy.configuration(ctx, devid)
    }
}

/// Returns true if the kernel device list names the blktap2 driver.
async fn driver_listed(proc_devices: &Path) -> Result<bool> {
    match tokio::fs::read_to_string(proc_devices).await {
        Ok(devices) => Ok(devices
            .lines()
            .any(|line| line.split_whitespace().any(|word| word == "blktap2"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

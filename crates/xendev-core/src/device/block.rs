//! Plain block devices.
//!
//! Request keys: `uname` (`<type>:<params>`, e.g. `phy:/dev/sdb1` or
//! `file:/images/disk.img`), `dev` (`xvda`, or `hdc:cdrom` for a CD-ROM) and
//! an optional `mode` of `r`, `w` or `w!`.

use async_trait::async_trait;

use crate::device::{
    DeviceClass, DeviceContext, DeviceController, DeviceDetails, DeviceId, DeviceRequest, Side,
};
use crate::error::{CoreError, Result};

const MODES: [&str; 3] = ["r", "w", "w!"];

/// Publishes block device descriptors.
///
/// The same controller serves the `vbd` class and, for images handed to the
/// legacy tap driver, the `tap` class.
#[derive(Debug, Clone, Copy)]
pub struct BlockController {
    class: DeviceClass,
}

impl BlockController {
    /// Controller for the `vbd` class.
    #[must_use]
    pub const fn vbd() -> Self {
        Self {
            class: DeviceClass::Vbd,
        }
    }

    /// Controller for the legacy `tap` class.
    #[must_use]
    pub const fn tap() -> Self {
        Self {
            class: DeviceClass::Tap,
        }
    }

    /// Builds descriptors without touching the store.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a missing or malformed `uname`, a
    /// missing `dev` or an unknown `mode`.
    pub fn details(&self, devid: DeviceId, request: &DeviceRequest) -> Result<DeviceDetails> {
        let uname = request
            .get_str("uname")
            .ok_or_else(|| CoreError::validation("block device needs a uname"))?;
        let (kind, params) = uname
            .split_once(':')
            .filter(|(kind, params)| !kind.is_empty() && !params.is_empty())
            .ok_or_else(|| CoreError::validation(format!("malformed uname {uname}")))?;

        let dev = request
            .get_str("dev")
            .ok_or_else(|| CoreError::validation("block device needs a dev"))?;
        let (dev, device_type) = match dev.split_once(':') {
            Some((name, "cdrom")) => (name, "cdrom"),
            Some((name, "disk")) | Some((name, "")) => (name, "disk"),
            Some(_) => return Err(CoreError::validation(format!("malformed dev {dev}"))),
            None => (dev, "disk"),
        };
        let dev = dev.strip_prefix("/dev/").unwrap_or(dev);
        if dev.is_empty() || dev.contains('/') {
            return Err(CoreError::validation(format!("malformed dev {dev}")));
        }

        let mode = request.get_str("mode").unwrap_or("r");
        if !MODES.contains(&mode) {
            return Err(CoreError::validation(format!("invalid mode {mode}")));
        }

        let mut details = DeviceDetails::new(devid);
        details.backend.insert("type".into(), kind.to_string());
        details.backend.insert("params".into(), params.to_string());
        details.backend.insert("dev".into(), dev.to_string());
        details.backend.insert("mode".into(), mode.to_string());
        details
            .frontend
            .insert("virtual-device".into(), devid.to_string());
        details
            .frontend
            .insert("device-type".into(), device_type.to_string());
        Ok(details)
    }
}

impl Default for BlockController {
    fn default() -> Self {
        Self::vbd()
    }
}

#[async_trait]
impl DeviceController for BlockController {
    fn class(&self) -> DeviceClass {
        self.class
    }

    async fn device_details(
        &self,
        _ctx: &DeviceContext,
        devid: DeviceId,
        request: &DeviceRequest,
    ) -> Result<DeviceDetails> {
        self.details(devid, request)
    }

    fn configuration(&self, ctx: &DeviceContext, devid: DeviceId) -> Result<DeviceRequest> {
        let backend = ctx.read_descriptor(self.class, devid, Side::Backend)?;
        let frontend = ctx.read_descriptor(self.class, devid, Side::Frontend)?;

        let field = |key: &str| backend.get(key).cloned().unwrap_or_default();
        let mut dev = field("dev");
        if frontend.get("device-type").map(String::as_str) == Some("cdrom") {
            dev.push_str(":cdrom");
        }
        let mut request = DeviceRequest::new()
            .with("uname", format!("{}:{}", field("type"), field("params")))
            .with("dev", dev)
            .with("mode", field("mode"));
        if let Some(phantom) = frontend.get("phantom_vbd") {
            request.insert("phantom_vbd", phantom.as_str());
        }
        Ok(request)
    }
}

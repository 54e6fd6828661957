//! Virtual network interfaces.
//!
//! Request keys: `script`, `bridge`, `mac` and `ip` (one address, a
//! space-separated string or a list). Script and bridge default from
//! [`NetworkSettings`]; a missing MAC is generated under the `00:16:3e`
//! prefix.

use async_trait::async_trait;

use crate::config::NetworkSettings;
use crate::device::{DeviceClass, DeviceContext, DeviceController, DeviceDetails, DeviceId, DeviceRequest, Side};
use crate::error::{CoreError, Result};

const XEN_OUI: [u8; 3] = [0x00, 0x16, 0x3e];

/// Network interface controller.
#[derive(Debug, Clone)]
pub struct NetController {
    settings: NetworkSettings,
}

impl NetController {
    /// Creates a controller using `settings` for defaults.
    #[must_use]
    pub const fn new(settings: NetworkSettings) -> Self {
        Self { settings }
    }

    /// Builds descriptors without touching the store.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed MAC address.
    pub fn details(&self, devid: DeviceId, request: &DeviceRequest) -> Result<DeviceDetails> {
        let script = request
            .get_str("script")
            .unwrap_or(&self.settings.vif_script);
        let script = self.settings.script_dir.join(script);
        let bridge = request
            .get_str("bridge")
            .unwrap_or(&self.settings.vif_bridge);
        let mac = match request.get_str("mac") {
            Some(mac) => normalize_mac(mac)?,
            None => random_mac(),
        };
        let ips = request.get_list("ip");

        let handle = devid.to_string();
        let mut details = DeviceDetails::new(devid);
        details
            .backend
            .insert("script".into(), script.to_string_lossy().into_owned());
        details.backend.insert("mac".into(), mac.clone());
        details.backend.insert("bridge".into(), bridge.to_string());
        details.backend.insert("handle".into(), handle.clone());
        if !ips.is_empty() {
            details.backend.insert("ip".into(), ips.join(" "));
        }
        details.frontend.insert("handle".into(), handle);
        details.frontend.insert("mac".into(), mac);
        Ok(details)
    }
}

#[async_trait]
impl DeviceController for NetController {
    fn class(&self) -> DeviceClass {
        DeviceClass::Vif
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
        let backend = ctx.read_descriptor(DeviceClass::Vif, devid, Side::Backend)?;
        let mut request = DeviceRequest::new();

        if let Some(script) = backend.get("script") {
            let prefix = format!("{}/", self.settings.script_dir.display());
            let script = script.strip_prefix(&prefix).unwrap_or(script);
            request.insert("script", script);
        }
        if let Some(ip) = backend.get("ip") {
            let ips: Vec<String> = ip.split(' ').map(ToString::to_string).collect();
            request.insert("ip", ips);
        }
        for key in ["bridge", "mac"] {
            if let Some(value) = backend.get(key) {
                request.insert(key, value.as_str());
            }
        }
        Ok(request)
    }
}

/// Checks a MAC address and lowercases it.
fn normalize_mac(mac: &str) -> Result<String> {
    let octets: Vec<&str> = mac.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(CoreError::validation(format!("invalid MAC address {mac}")));
    }
    Ok(mac.to_ascii_lowercase())
}

/// Random locally administered address under the Xen prefix.
fn random_mac() -> String {
    let random = uuid::Uuid::new_v4();
    let bytes = random.as_bytes();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        XEN_OUI[0],
        XEN_OUI[1],
        XEN_OUI[2],
        bytes[0] & 0x7f,
        bytes[1],
        bytes[2]
    )
}

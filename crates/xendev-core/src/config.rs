//! Settings.
//!
//! Settings are loaded from multiple sources with the following priority:
//!
//! 1. Environment variables (`XENDEV_*`, sections split on `__`)
//! 2. User config file (`~/.config/xendev/config.toml`)
//! 3. System config file (`/etc/xendev/config.toml`)
//! 4. Default values
//!
//! ## Example Configuration File
//!
//! ```toml
//! [console]
//! base_port = 9600
//! bind_address = "127.0.0.1"
//!
//! [network]
//! script_dir = "/etc/xen/scripts"
//! vif_bridge = "xenbr1"
//!
//! [blktap]
//! binary = "/usr/sbin/tapdisk2"
//! helper_timeout_ms = 10000
//!
//! [logging]
//! level = "debug"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Control plane settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Console bridge settings.
    pub console: ConsoleSettings,
    /// Network interface defaults.
    pub network: NetworkSettings,
    /// Block tap negotiation settings.
    pub blktap: BlktapSettings,
    /// Logging settings for embedders that install a subscriber.
    pub logging: LoggingSettings,
}

impl Settings {
    /// Loads settings from files and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be parsed or a value has the
    /// wrong type.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(system_config_path()))
            .merge(Toml::file(user_config_path()))
            .merge(Env::prefixed("XENDEV_").split("__"))
            .extract()
    }

    /// Loads settings from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or a value has the wrong
    /// type.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("XENDEV_").split("__"))
            .extract()
    }
}

/// Console bridge settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSettings {
    /// Console of domain `n` listens on `base_port + n`.
    pub base_port: u16,
    /// Address console listeners bind to.
    pub bind_address: String,
    /// Bytes of guest output kept while no terminal is attached.
    pub read_buffer_limit: usize,
    /// Largest single write to a terminal.
    pub output_chunk: usize,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            base_port: 9600,
            bind_address: "0.0.0.0".to_string(),
            read_buffer_limit: 64 * 1024,
            output_chunk: 4096,
        }
    }
}

/// Network interface defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Directory relative script names are resolved against.
    pub script_dir: PathBuf,
    /// Script used when a request names none.
    pub vif_script: String,
    /// Bridge used when a request names none.
    pub vif_bridge: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            script_dir: PathBuf::from("/etc/xen/scripts"),
            vif_script: "vif-bridge".to_string(),
            vif_bridge: "xenbr0".to_string(),
        }
    }
}

/// Block tap negotiation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlktapSettings {
    /// Helper that creates tap devices.
    pub binary: PathBuf,
    /// Prefix of the device nodes the helper reports.
    pub device_prefix: String,
    /// Prefix of the sysfs control nodes.
    pub control_prefix: String,
    /// Kernel device list checked for the `blktap2` driver.
    pub proc_devices: PathBuf,
    /// Device directory checked for existing phantom device names.
    pub dev_dir: PathBuf,
    /// Upper bound on a single helper run, in milliseconds.
    pub helper_timeout_ms: u64,
    /// Formats of `tap:tapdisk:` images served by the legacy driver.
    pub legacy_formats: Vec<String>,
}

impl BlktapSettings {
    /// Upper bound on a single helper run.
    #[must_use]
    pub const fn helper_timeout(&self) -> Duration {
        Duration::from_millis(self.helper_timeout_ms)
    }
}

impl Default for BlktapSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/sbin/tapdisk2"),
            device_prefix: "/dev/xen/blktap-2/tapdev".to_string(),
            control_prefix: "/sys/class/blktap2/blktap".to_string(),
            proc_devices: PathBuf::from("/proc/devices"),
            dev_dir: PathBuf::from("/dev"),
            helper_timeout_ms: 30_000,
            legacy_formats: ["ioemu", "qcow2", "vmdk", "sync"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level filter.
    pub level: String,
    /// Output format, `text` or `json`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

fn system_config_path() -> PathBuf {
    PathBuf::from("/etc/xendev/config.toml")
}

fn user_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("xendev")
        .join("config.toml")
}

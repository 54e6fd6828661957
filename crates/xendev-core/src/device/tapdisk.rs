//! Tap device negotiation with the external helper.
//!
//! The helper is run as `<binary> -n <format>:<path>` and answers with one
//! line naming the device node it created, either `<device>` or
//! `<minor>:<device>:<control>`. Each run is bounded by a timeout; a helper
//! that overruns is killed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

use crate::config::BlktapSettings;
use crate::error::{CoreError, Result};

/// A tap device created by the helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapDevice {
    /// Device minor number.
    pub minor: u32,
    /// Block device node, e.g. `/dev/xen/blktap-2/tapdev3`.
    pub device: String,
    /// Sysfs control node.
    pub control: String,
}

/// Runs the tap helper and parses its answer.
#[derive(Debug, Clone)]
pub struct TapdiskHelper {
    binary: PathBuf,
    control_prefix: String,
    timeout: Duration,
    device_pattern: Regex,
}

impl TapdiskHelper {
    /// Creates a helper from settings.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the device prefix cannot form a pattern.
    pub fn new(settings: &BlktapSettings) -> Result<Self> {
        let pattern = format!("^{}(\\d+)$", regex::escape(&settings.device_prefix));
        let device_pattern = Regex::new(&pattern)
            .map_err(|e| CoreError::validation(format!("bad tap device prefix: {e}")))?;
        Ok(Self {
            binary: settings.binary.clone(),
            control_prefix: settings.control_prefix.clone(),
            timeout: settings.helper_timeout(),
            device_pattern,
        })
    }

    /// Asks the helper to create a tap device for `format:path`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Negotiation`] if the helper cannot be started or exits
    ///   with a non-zero status
    /// - [`CoreError::Timeout`] if it does not finish in time
    /// - [`CoreError::Validation`] if its output names no valid device
    pub async fn negotiate(&self, format: &str, path: &str) -> Result<TapDevice> {
        let target = format!("{format}:{path}");
        tracing::debug!(binary = %self.binary.display(), %target, "running tap helper");

        let child = Command::new(&self.binary)
            .arg("-n")
            .arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::Negotiation {
                message: format!("failed to start {}: {e}", self.binary.display()),
                stdout: String::new(),
                stderr: String::new(),
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                tracing::warn!(%target, timeout = ?self.timeout, "tap helper timed out, killed");
                return Err(CoreError::Timeout {
                    what: format!("tap helper for {target}"),
                    after: self.timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        if !output.status.success() {
            return Err(CoreError::Negotiation {
                message: format!(
                    "failed to create tap device ({}); check that {path} exists and that the blktap2 driver is loaded",
                    output.status
                ),
                stdout,
                stderr,
            });
        }

        let line = stdout.lines().next().unwrap_or_default();
        let device = self.parse_output(line).map_err(|e| {
            CoreError::validation(format!("{e}; helper stdout: {stdout:?}, stderr: {stderr:?}"))
        })?;
        tracing::info!(%target, device = %device.device, minor = device.minor, "tap device created");
        Ok(device)
    }

    /// Removes a tap device created by [`TapdiskHelper::negotiate`] by
    /// writing to the `remove` attribute of its control node.
    ///
    /// # Errors
    ///
    /// Fails if the control node cannot be written.
    pub async fn release(&self, tap: &TapDevice) -> Result<()> {
        let remove = Path::new(&tap.control).join("remove");
        tokio::fs::write(&remove, b"1").await?;
        tracing::info!(device = %tap.device, minor = tap.minor, "tap device released");
        Ok(())
    }

    /// Parses one line of helper output.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the line names no device under the
    /// configured prefix or its fields disagree.
    pub fn parse_output(&self, line: &str) -> Result<TapDevice> {
        let line = line.trim();
        let mut fields = line.splitn(3, ':');
        match (fields.next(), fields.next(), fields.next()) {
            (Some(minor), Some(device), Some(control)) => {
                let minor: u32 = minor
                    .parse()
                    .map_err(|_| CoreError::validation(format!("malformed tap minor in {line:?}")))?;
                let found = self.device_minor(device)?;
                if found != minor {
                    return Err(CoreError::validation(format!(
                        "tap minor {minor} does not match device {device}"
                    )));
                }
                Ok(TapDevice {
                    minor,
                    device: device.to_string(),
                    control: control.to_string(),
                })
            }
            (Some(device), None, None) => {
                let minor = self.device_minor(device)?;
                Ok(TapDevice {
                    minor,
                    device: device.to_string(),
                    control: format!("{}{minor}", self.control_prefix),
                })
            }
            _ => Err(CoreError::validation(format!("malformed tap helper output {line:?}"))),
        }
    }

    fn device_minor(&self, device: &str) -> Result<u32> {
        if !device.contains("/dev") {
            return Err(CoreError::validation(format!("invalid tap device {device:?}")));
        }
        self.device_pattern
            .captures(device)
            .and_then(|caps| caps.get(1))
            .and_then(|minor| minor.as_str().parse().ok())
            .ok_or_else(|| CoreError::validation(format!("malformed tap device {device:?}")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Writes an executable shell script standing in for the helper.
    pub(crate) fn fake_helper(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("tapdisk2");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn helper_with(binary: PathBuf, timeout_ms: u64) -> TapdiskHelper {
        TapdiskHelper::new(&BlktapSettings {
            binary,
            helper_timeout_ms: timeout_ms,
            ..BlktapSettings::default()
        })
        .unwrap()
    }

    fn helper() -> TapdiskHelper {
        helper_with(PathBuf::from("/nonexistent/tapdisk2"), 1000)
    }

    #[test]
    fn test_parse_full_triplet() {
        let device = helper()
            .parse_output("3:/dev/xen/blktap-2/tapdev3:/sys/class/blktap2/blktap3\n")
            .unwrap();
        assert_eq!(device.minor, 3);
        assert_eq!(device.device, "/dev/xen/blktap-2/tapdev3");
        assert_eq!(device.control, "/sys/class/blktap2/blktap3");
    }

    #[test]
    fn test_parse_bare_device_derives_control() {
        let device = helper().parse_output("/dev/xen/blktap-2/tapdev12").unwrap();
        assert_eq!(device.minor, 12);
        assert_eq!(device.control, "/sys/class/blktap2/blktap12");
    }

    #[test]
    fn test_parse_rejects_malformed_output() {
        let helper = helper();
        for line in [
            "",
            "tapdev3",
            "/dev/sda1",
            "/dev/xen/blktap-2/tapdevX",
            "/dev/xen/blktap-2/tapdev3extra",
            "4:/dev/xen/blktap-2/tapdev3:/sys/class/blktap2/blktap3",
            "x:/dev/xen/blktap-2/tapdev3:/sys/class/blktap2/blktap3",
            "3:/dev/xen/blktap-2/tapdev3",
        ] {
            assert!(
                helper.parse_output(line).unwrap_err().is_validation(),
                "accepted {line:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_negotiate_passes_target_and_parses() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_helper(
            dir.path(),
            "[ \"$1\" = \"-n\" ] || exit 2\n[ \"$2\" = \"aio:/images/a.img\" ] || exit 3\necho /dev/xen/blktap-2/tapdev5",
        );
        let device = helper_with(script, 5000)
            .negotiate("aio", "/images/a.img")
            .await
            .unwrap();
        assert_eq!(device.minor, 5);
    }

    #[tokio::test]
    async fn test_negotiate_failure_carries_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_helper(dir.path(), "echo partial\necho 'no such image' >&2\nexit 1");
        let err = helper_with(script, 5000)
            .negotiate("vhd", "/missing.vhd")
            .await
            .unwrap_err();
        match err {
            CoreError::Negotiation { stdout, stderr, .. } => {
                assert_eq!(stdout, "partial");
                assert_eq!(stderr, "no such image");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_negotiate_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_helper(dir.path(), "exec sleep 30");
        let err = helper_with(script, 100)
            .negotiate("aio", "/images/slow.img")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_negotiate_missing_binary() {
        let err = helper().negotiate("aio", "/images/a.img").await.unwrap_err();
        assert!(err.is_negotiation());
    }

    #[tokio::test]
    async fn test_negotiate_garbage_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_helper(dir.path(), "echo hello");
        let err = helper_with(script, 5000)
            .negotiate("aio", "/images/a.img")
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("hello"));
    }

    #[tokio::test]
    async fn test_release_writes_remove_attribute() {
        let dir = tempfile::tempdir().unwrap();
        let control = dir.path().join("blktap6");
        std::fs::create_dir(&control).unwrap();
        let tap = TapDevice {
            minor: 6,
            device: "/dev/xen/blktap-2/tapdev6".to_string(),
            control: control.display().to_string(),
        };

        helper().release(&tap).await.unwrap();
        assert_eq!(std::fs::read_to_string(control.join("remove")).unwrap(), "1");
    }

    #[tokio::test]
    async fn test_release_missing_control_node() {
        let tap = TapDevice {
            minor: 6,
            device: "/dev/xen/blktap-2/tapdev6".to_string(),
            control: "/nonexistent/blktap6".to_string(),
        };
        assert!(helper().release(&tap).await.is_err());
    }
}

use crate::error::{FlashError, Result};
use crate::tool::{DeviceTool, ToolCommand, ToolKind};
use std::fmt;
use tracing::{debug, info};

/// Opaque identifier of one attached device, as reported by `adb` or `fastboot`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceSerial(String);

impl DeviceSerial {
    pub fn new(serial: impl Into<String>) -> Self {
        Self(serial.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceSerial {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A device discovered at the start of a run.
///
/// `reported_by` records which tool listed the device, and therefore which
/// mode it was in at the time: booted into Android (`adb`) or sitting in the
/// bootloader (`fastboot`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectedDevice {
    pub serial: DeviceSerial,
    pub reported_by: ToolKind,
    /// The connection state column of `adb devices` (e.g. "device",
    /// "unauthorized"), or "fastboot".
    pub state: String,
}

impl fmt::Display for ConnectedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<20} {:<9} {}",
            self.serial.as_str(),
            self.reported_by.to_string(),
            self.state
        )
    }
}

/// Parses the output of `adb devices`.
///
/// The first line is the "List of devices attached" banner; every following
/// non-empty line is `<serial>\t<state>`. Daemon start-up chatter
/// (`* daemon started successfully`) is skipped.
pub fn parse_adb_devices(output: &str) -> Vec<ConnectedDevice> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with('*') && !line.starts_with("List of devices"))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            let state = fields.next().unwrap_or("unknown");
            Some(ConnectedDevice {
                serial: DeviceSerial::new(serial),
                reported_by: ToolKind::Adb,
                state: state.to_string(),
            })
        })
        .collect()
}

/// Parses the output of `fastboot devices`: one `<serial>\tfastboot` per line.
pub fn parse_fastboot_devices(output: &str) -> Vec<ConnectedDevice> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let serial = line.split_whitespace().next()?;
            Some(ConnectedDevice {
                serial: DeviceSerial::new(serial),
                reported_by: ToolKind::Fastboot,
                state: "fastboot".to_string(),
            })
        })
        .collect()
}

fn list(tool: &dyn DeviceTool, kind: ToolKind) -> Vec<ConnectedDevice> {
    let command = ToolCommand::global(kind, ["devices"]);
    match tool.invoke(&command) {
        Ok(output) if output.success => match kind {
            ToolKind::Adb => parse_adb_devices(&output.stdout),
            ToolKind::Fastboot => parse_fastboot_devices(&output.stdout),
        },
        Ok(output) => {
            debug!("{kind} devices failed: {}", output.failure_detail());
            Vec::new()
        }
        Err(e) => {
            debug!("{kind} devices failed: {e}");
            Vec::new()
        }
    }
}

/// Takes a snapshot of the connected devices.
///
/// Devices visible to `adb` are preferred. Only when `adb` reports none is
/// `fastboot` asked, so a fleet already sitting in the bootloader can still be
/// flashed. Duplicate serials are dropped, keeping the first occurrence.
///
/// # Errors
///
/// Returns [`FlashError::NoDevices`] if neither tool reports a device.
pub fn enumerate(tool: &dyn DeviceTool) -> Result<Vec<ConnectedDevice>> {
    let mut devices = list(tool, ToolKind::Adb);
    if devices.is_empty() {
        devices = list(tool, ToolKind::Fastboot);
    }

    let mut seen = std::collections::HashSet::new();
    devices.retain(|d| seen.insert(d.serial.clone()));

    if devices.is_empty() {
        return Err(FlashError::NoDevices);
    }
    info!(count = devices.len(), "devices connected");
    Ok(devices)
}

//! Single-shot reads of device state variables.
//!
//! None of these functions retry. Retrying belongs to
//! [`confirm`](crate::confirm), which calls them once per poll.
use crate::device::DeviceSerial;
use crate::tool::{DeviceTool, ToolCommand};
use tracing::trace;

/// Extracts `name` from `fastboot getvar` output.
///
/// fastboot prints `<name>: <value>` (usually on stderr) followed by a
/// `Finished. Total time` line. Some bootloaders prefix the line with
/// `(bootloader) `.
pub fn parse_getvar(output: &str, name: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let line = line.trim();
        let line = line.strip_prefix("(bootloader)").unwrap_or(line).trim_start();
        let value = line.strip_prefix(name)?.strip_prefix(':')?.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Reads one bootloader variable with `fastboot getvar`.
///
/// Returns `None` if the command fails or the variable is not reported.
pub fn get_var(tool: &dyn DeviceTool, serial: &DeviceSerial, name: &str) -> Option<String> {
    let command = ToolCommand::fastboot(serial, ["getvar", name]);
    let output = tool.invoke(&command).ok()?;
    if !output.success {
        return None;
    }
    let value = parse_getvar(&output.stderr, name).or_else(|| parse_getvar(&output.stdout, name));
    trace!(%serial, variable = name, value = ?value, "getvar");
    value
}

/// Reads one Android system property with `adb shell getprop`.
pub fn get_prop(tool: &dyn DeviceTool, serial: &DeviceSerial, name: &str) -> Option<String> {
    let command = ToolCommand::adb(serial, ["shell", "getprop", name]);
    let output = tool.invoke(&command).ok()?;
    if !output.success {
        return None;
    }
    let value = output.stdout.trim().trim_matches(|c| c == '[' || c == ']').trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Reads the adb connection state (`device`, `recovery`, `sideload`, ...).
pub fn get_state(tool: &dyn DeviceTool, serial: &DeviceSerial) -> Option<String> {
    let command = ToolCommand::adb(serial, ["get-state"]);
    let output = tool.invoke(&command).ok()?;
    if !output.success {
        return None;
    }
    let value = output.stdout.trim();
    (!value.is_empty()).then(|| value.to_string())
}

//! Invocation of the two external device tools, `adb` and `fastboot`.
//!
//! Every call builds a fresh [`ToolCommand`] value. Nothing is shared between
//! invocations, so device tasks running on separate threads can issue commands
//! through the same [`DeviceTool`] without coordinating.
use crate::device::DeviceSerial;
use crate::error::{FlashError, Result};
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Which external tool a command is addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Adb,
    Fastboot,
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolKind::Adb => f.write_str("adb"),
            ToolKind::Fastboot => f.write_str("fastboot"),
        }
    }
}

/// One immutable tool invocation: the tool, an optional target serial, and
/// the arguments that follow `-s <serial>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCommand {
    pub kind: ToolKind,
    pub serial: Option<DeviceSerial>,
    pub args: Vec<OsString>,
}

impl ToolCommand {
    /// A command addressed to no particular device (e.g. `adb devices`).
    pub fn global<I, S>(kind: ToolKind, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            kind,
            serial: None,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// A command addressed to a single device.
    pub fn for_device<I, S>(kind: ToolKind, serial: &DeviceSerial, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            kind,
            serial: Some(serial.clone()),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn adb<I, S>(serial: &DeviceSerial, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self::for_device(ToolKind::Adb, serial, args)
    }

    pub fn fastboot<I, S>(serial: &DeviceSerial, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self::for_device(ToolKind::Fastboot, serial, args)
    }

    /// The complete argument vector handed to the tool binary.
    pub fn argv(&self) -> Vec<OsString> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        if let Some(serial) = &self.serial {
            argv.push(OsString::from("-s"));
            argv.push(OsString::from(serial.as_str()));
        }
        argv.extend(self.args.iter().cloned());
        argv
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for arg in self.argv() {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Captured result of one invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// A short description of why the command failed, for logs and errors.
    pub fn failure_detail(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        match text.lines().last() {
            Some(line) if !line.is_empty() => line.to_string(),
            _ => "exited with a failure status".to_string(),
        }
    }
}

/// The capability the flashing engine needs from the outside world: run one
/// tool command to completion and hand back what it printed.
///
/// Implementations must be callable from many device threads at once.
pub trait DeviceTool: Sync {
    fn invoke(&self, command: &ToolCommand) -> io::Result<ToolOutput>;
}

/// [`DeviceTool`] backed by real `adb` and `fastboot` processes.
#[derive(Clone, Debug)]
pub struct ProcessTool {
    adb: PathBuf,
    fastboot: PathBuf,
}

impl Default for ProcessTool {
    fn default() -> Self {
        Self::new("adb", "fastboot")
    }
}

impl ProcessTool {
    pub fn new(adb: impl Into<PathBuf>, fastboot: impl Into<PathBuf>) -> Self {
        Self {
            adb: adb.into(),
            fastboot: fastboot.into(),
        }
    }

    fn program(&self, kind: ToolKind) -> &Path {
        match kind {
            ToolKind::Adb => &self.adb,
            ToolKind::Fastboot => &self.fastboot,
        }
    }

    /// Confirms both tools can be executed by asking each for its version.
    pub fn check(&self) -> Result<()> {
        for (kind, flag) in [(ToolKind::Adb, "version"), (ToolKind::Fastboot, "--version")] {
            let command = ToolCommand::global(kind, [flag]);
            match self.invoke(&command) {
                Ok(output) if output.success => {
                    let version = output.stdout.lines().next().unwrap_or_default();
                    debug!(tool = %kind, version, "tool available");
                }
                Ok(output) => {
                    return Err(FlashError::ToolUnavailable {
                        tool: self.program(kind).display().to_string(),
                        reason: output.failure_detail(),
                    });
                }
                Err(e) => {
                    return Err(FlashError::ToolUnavailable {
                        tool: self.program(kind).display().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Restarts the adb server so stale device authorisations are dropped.
    pub fn kill_server(&self) {
        let command = ToolCommand::global(ToolKind::Adb, ["kill-server"]);
        match self.invoke(&command) {
            Ok(output) if output.success => {}
            Ok(output) => warn!("adb kill-server failed: {}", output.failure_detail()),
            Err(e) => warn!("adb kill-server failed: {e}"),
        }
    }
}

impl DeviceTool for ProcessTool {
    fn invoke(&self, command: &ToolCommand) -> io::Result<ToolOutput> {
        debug!(command = %command, "invoking");
        let output = Command::new(self.program(command.kind))
            .args(command.argv())
            .output()?;
        Ok(ToolOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

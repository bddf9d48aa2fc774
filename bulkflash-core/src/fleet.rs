//! Fans one [`DeviceTask`] out per connected device and joins them all.
//!
//! Run-level preparation (model lookup, artifact resolution) happens on the
//! calling thread and can fail the whole run. Once tasks are spawned, a failure
//! in one of them is only recorded in its [`TaskReport`]; siblings keep going
//! and [`Fleet::run`] returns after every task has finished.
use crate::artifacts::{ArtifactResolver, ProvisioningMode, RunArtifacts};
use crate::confirm::{Sleeper, ThreadSleeper};
use crate::device::{ConnectedDevice, DeviceSerial};
use crate::error::{FlashError, Result};
use crate::poller;
use crate::task::{DeviceTask, FlashOptions, Outcome, TaskContext, TaskObserver, TaskReport};
use crate::tool::{DeviceTool, ToolKind};
use std::any::Any;
use std::collections::HashSet;
use std::thread;
use tracing::{info, warn};

/// Android property holding the device codename.
pub const MODEL_PROP: &str = "ro.product.device";

/// Outcome of a whole run.
#[derive(Debug)]
pub struct FleetReport {
    pub model: String,
    pub mode: ProvisioningMode,
    pub tasks: Vec<TaskReport>,
}

impl FleetReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| t.outcome.is_done())
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| !t.outcome.is_done())
    }

    pub fn all_done(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn task(&self, serial: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.serial.as_str() == serial)
    }
}

/// Determines the device codename from the first connected device.
///
/// A device visible to adb is asked for [`MODEL_PROP`]; if that fails, or the
/// device is in the bootloader, the `product` bootloader variable is used.
pub fn resolve_model(tool: &dyn DeviceTool, devices: &[ConnectedDevice]) -> Result<String> {
    let first = devices.first().ok_or(FlashError::NoDevices)?;
    let model = match first.reported_by {
        ToolKind::Adb => poller::get_prop(tool, &first.serial, MODEL_PROP),
        ToolKind::Fastboot => None,
    }
    .or_else(|| poller::get_var(tool, &first.serial, crate::task::PRODUCT_VAR));

    match model {
        Some(model) => {
            info!(serial = %first.serial, model, "device model resolved");
            Ok(model)
        }
        None => Err(FlashError::missing(format!(
            "device model (could not query {})",
            first.serial
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn panicked(serial: DeviceSerial, message: String) -> TaskReport {
    let error = FlashError::TaskPanicked {
        serial: serial.clone(),
        message,
    };
    TaskReport {
        serial,
        phases: Vec::new(),
        last_error: Some(error.to_string()),
        outcome: Outcome::Failed { step: None, error },
    }
}

/// Runs batches of devices against one tool, clock and observer.
pub struct Fleet<'a> {
    tool: &'a dyn DeviceTool,
    sleeper: &'a dyn Sleeper,
    observer: &'a dyn TaskObserver,
    options: FlashOptions,
}

impl<'a> Fleet<'a> {
    pub fn new(tool: &'a dyn DeviceTool) -> Self {
        Self {
            tool,
            sleeper: &ThreadSleeper,
            observer: &(),
            options: FlashOptions::default(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: &'a dyn Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn TaskObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_options(mut self, options: FlashOptions) -> Self {
        self.options = options;
        self
    }

    /// Resolves the run's model and artifacts, then flashes every device.
    ///
    /// # Errors
    ///
    /// Only run-level errors are returned, and always before any device has
    /// been touched. Per-device failures are in the returned report.
    pub fn run(
        &self,
        devices: &[ConnectedDevice],
        mode: ProvisioningMode,
        resolver: &dyn ArtifactResolver,
    ) -> Result<FleetReport> {
        let model = resolve_model(self.tool, devices)?;
        let artifacts = resolver.resolve(&model, mode)?;
        let tasks = self.flash_all(devices, &artifacts);
        let report = FleetReport { model, mode, tasks };
        info!(
            succeeded = report.succeeded().count(),
            failed = report.failed().count(),
            "bulk flashing complete"
        );
        Ok(report)
    }

    /// Spawns one thread per device and waits for all of them.
    ///
    /// Each serial is flashed at most once; repeated serials are skipped. The
    /// reports come back in the order the devices were given.
    pub fn flash_all(&self, devices: &[ConnectedDevice], artifacts: &RunArtifacts) -> Vec<TaskReport> {
        let ctx = TaskContext {
            tool: self.tool,
            sleeper: self.sleeper,
            observer: self.observer,
            artifacts,
            options: &self.options,
        };

        let mut seen = HashSet::new();
        let devices: Vec<&ConnectedDevice> = devices
            .iter()
            .filter(|d| {
                let first = seen.insert(&d.serial);
                if !first {
                    warn!(serial = %d.serial, "device listed twice, flashing it once");
                }
                first
            })
            .collect();

        thread::scope(|scope| {
            let handles: Vec<_> = devices
                .iter()
                .map(|&device| {
                    let handle = thread::Builder::new()
                        .name(format!("flash-{}", device.serial))
                        .spawn_scoped(scope, move || DeviceTask::new(ctx, device).run());
                    (device.serial.clone(), handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(serial, handle)| {
                    let lost = match handle {
                        Ok(handle) => match handle.join() {
                            Ok(report) => return report,
                            Err(payload) => panicked(serial, panic_message(&*payload)),
                        },
                        Err(e) => panicked(serial, format!("could not spawn task thread: {e}")),
                    };
                    // The task never got to report itself.
                    self.observer.finished(&lost);
                    lost
                })
                .collect()
        })
    }
}

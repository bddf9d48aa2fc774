//! The sequence of operations applied to one device.
//!
//! A [`DeviceTask`] owns its device for the duration of the run and walks it
//! strictly forward through [`Phase`]s. The first failing step ends the task;
//! nothing is retried or rolled back, and a device left half-flashed needs
//! manual recovery.
//!
//! ```text
//! factory image:  Start → RebootedToBootloader → BootloaderUnlocked
//!                 → FirmwarePartitionsFlashed → UpdatePackageFlashed
//!                 → RebootedToBootloaderPostFlash → [KeyProvisioned
//!                 → [BootloaderRelocked]] → Rebooted → Done
//! OTA sideload:   Start → RebootedToRecovery → WaitingForSideload
//!                 → OtaPushed → Done
//! ```
use crate::artifacts::{ImageBundle, Images, RunArtifacts};
use crate::confirm::{Confirmation, Sleeper};
use crate::device::{ConnectedDevice, DeviceSerial};
use crate::error::{FlashError, Result};
use crate::poller;
use crate::tool::{DeviceTool, ToolCommand, ToolKind};
use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

/// Bootloader variable reporting the lock state (`yes` / `no`).
pub const UNLOCKED_VAR: &str = "unlocked";
/// Bootloader variable read to choose how firmware is flashed. Devices that
/// report a type for the `radio` partition take single bootloader and radio
/// images; the rest take the discrete images of the partition directory.
pub const FIRMWARE_LAYOUT_VAR: &str = "partition-type:radio";
/// Bootloader variable naming the device product, matched against the relock
/// exemption list.
pub const PRODUCT_VAR: &str = "product";
/// Partition holding the custom verified-boot key.
pub const AVB_KEY_PARTITION: &str = "avb_custom_key";
/// adb state a device reports once recovery accepts a sideload.
pub const SIDELOAD_STATE: &str = "sideload";

/// Tunables shared by every task of a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlashOptions {
    /// Pause after every `reboot-bootloader` so the device re-enumerates.
    pub settle: Duration,
    pub confirm_interval: Duration,
    pub confirm_attempts: u32,
    pub sideload_interval: Duration,
    pub sideload_attempts: u32,
    /// Products that must stay unlockable and are never relocked.
    pub relock_exempt: Vec<String>,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(5),
            confirm_interval: Duration::from_secs(30),
            confirm_attempts: 3,
            sideload_interval: Duration::from_secs(5),
            sideload_attempts: 60,
            relock_exempt: Vec::new(),
        }
    }
}

impl FlashOptions {
    pub fn is_relock_exempt(&self, product: &str) -> bool {
        self.relock_exempt.iter().any(|p| p == product)
    }
}

/// States a device passes through. Declaration order is the only order in
/// which phases may be entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Start,
    RebootedToBootloader,
    RebootedToRecovery,
    WaitingForSideload,
    OtaPushed,
    BootloaderUnlocked,
    FirmwarePartitionsFlashed,
    UpdatePackageFlashed,
    RebootedToBootloaderPostFlash,
    KeyProvisioned,
    BootloaderRelocked,
    Rebooted,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Start => "starting",
            Phase::RebootedToBootloader => "in bootloader",
            Phase::RebootedToRecovery => "in recovery",
            Phase::WaitingForSideload => "waiting for sideload",
            Phase::OtaPushed => "OTA pushed",
            Phase::BootloaderUnlocked => "bootloader unlocked",
            Phase::FirmwarePartitionsFlashed => "firmware flashed",
            Phase::UpdatePackageFlashed => "OS flashed, userdata wiped",
            Phase::RebootedToBootloaderPostFlash => "back in bootloader",
            Phase::KeyProvisioned => "AVB key provisioned",
            Phase::BootloaderRelocked => "bootloader relocked",
            Phase::Rebooted => "rebooted",
            Phase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Operations a task performs, named in logs and failure reasons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    RebootToBootloader,
    BootloaderUnlock,
    FirmwareFlash,
    BootloaderFlash,
    RadioFlash,
    PartitionFlash,
    UpdatePackageFlash,
    KeyErase,
    KeyFlash,
    BootloaderRelock,
    Reboot,
    RebootToRecovery,
    SideloadWait,
    Sideload,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::RebootToBootloader => "reboot to bootloader",
            Step::BootloaderUnlock => "bootloader unlock",
            Step::FirmwareFlash => "firmware flash",
            Step::BootloaderFlash => "bootloader flash",
            Step::RadioFlash => "radio flash",
            Step::PartitionFlash => "partition flash",
            Step::UpdatePackageFlash => "update package flash",
            Step::KeyErase => "avb key erase",
            Step::KeyFlash => "avb key flash",
            Step::BootloaderRelock => "bootloader relock",
            Step::Reboot => "reboot",
            Step::RebootToRecovery => "reboot to recovery",
            Step::SideloadWait => "sideload wait",
            Step::Sideload => "OTA sideload",
        };
        f.write_str(s)
    }
}

/// Receives progress from running tasks. Called from the tasks' threads.
pub trait TaskObserver: Sync {
    fn phase_entered(&self, _serial: &DeviceSerial, _phase: Phase) {}

    /// The task now needs the operator to act on the device itself.
    fn awaiting_operator(&self, _serial: &DeviceSerial, _step: Step) {}

    fn finished(&self, _report: &TaskReport) {}
}

impl TaskObserver for () {}

#[derive(Debug)]
pub enum Outcome {
    Done,
    /// `step` is `None` only when the task died without reaching a step
    /// boundary (a panic on its thread).
    Failed {
        step: Option<Step>,
        error: FlashError,
    },
}

impl Outcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Outcome::Done)
    }

    /// The name of the failing step, or `None` when the task completed.
    pub fn reason(&self) -> Option<String> {
        match self {
            Outcome::Done => None,
            Outcome::Failed {
                step: Some(step), ..
            } => Some(step.to_string()),
            Outcome::Failed { error, .. } => Some(error.to_string()),
        }
    }
}

/// What one task did, returned when it reaches a terminal state.
#[derive(Debug)]
pub struct TaskReport {
    pub serial: DeviceSerial,
    /// Every phase entered, in order, starting with [`Phase::Start`]. Empty if
    /// the task panicked.
    pub phases: Vec<Phase>,
    pub outcome: Outcome,
    /// The most recent error the task saw. On a completed task this is a
    /// tolerated failure, such as an AVB key erase on a device with no key.
    pub last_error: Option<String>,
}

/// Mutable state owned by exactly one task and dropped when it finishes.
#[derive(Debug)]
struct DeviceTaskState {
    serial: DeviceSerial,
    phase: Phase,
    last_error: Option<String>,
}

/// How the firmware of a device is laid out, read from the device itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FirmwareLayout {
    Monolithic,
    Discrete,
}

impl FirmwareLayout {
    fn from_reported(value: Option<&str>) -> Self {
        match value {
            Some(_) => FirmwareLayout::Monolithic,
            None => FirmwareLayout::Discrete,
        }
    }
}

/// Borrowed context every task of a run shares.
#[derive(Clone, Copy)]
pub struct TaskContext<'a> {
    pub tool: &'a dyn DeviceTool,
    pub sleeper: &'a dyn Sleeper,
    pub observer: &'a dyn TaskObserver,
    pub artifacts: &'a RunArtifacts,
    pub options: &'a FlashOptions,
}

pub struct DeviceTask<'a> {
    ctx: TaskContext<'a>,
    reported_by: ToolKind,
    state: DeviceTaskState,
    phases: Vec<Phase>,
}

impl<'a> DeviceTask<'a> {
    pub fn new(ctx: TaskContext<'a>, device: &ConnectedDevice) -> Self {
        Self {
            ctx,
            reported_by: device.reported_by,
            state: DeviceTaskState {
                serial: device.serial.clone(),
                phase: Phase::Start,
                last_error: None,
            },
            phases: vec![Phase::Start],
        }
    }

    /// Drives the device to a terminal state and reports how it went.
    pub fn run(mut self) -> TaskReport {
        info!(serial = %self.state.serial, mode = %self.ctx.artifacts.mode(), "task started");
        self.ctx.observer.phase_entered(&self.state.serial, Phase::Start);

        let artifacts = self.ctx.artifacts;
        let result = match &artifacts.images {
            Images::Factory(bundle) => self.provision_factory(bundle),
            Images::Ota(package) => self.sideload(package),
        };

        let outcome = match result {
            Ok(()) => {
                self.advance(Phase::Done);
                Outcome::Done
            }
            Err(error) => {
                let step = error.step();
                error!(
                    serial = %self.state.serial,
                    step = ?step,
                    phase = ?self.state.phase,
                    "device failed: {error}"
                );
                self.state.last_error = Some(error.to_string());
                Outcome::Failed { step, error }
            }
        };

        let report = TaskReport {
            serial: self.state.serial.clone(),
            phases: std::mem::take(&mut self.phases),
            outcome,
            last_error: self.state.last_error.take(),
        };
        self.ctx.observer.finished(&report);
        report
    }

    fn serial(&self) -> &DeviceSerial {
        &self.state.serial
    }

    fn advance(&mut self, phase: Phase) {
        debug_assert!(phase > self.state.phase, "{phase:?} after {:?}", self.state.phase);
        self.state.phase = phase;
        self.phases.push(phase);
        info!(serial = %self.state.serial, ?phase, "phase reached");
        self.ctx.observer.phase_entered(&self.state.serial, phase);
    }

    fn command<I, S>(&self, kind: ToolKind, step: Step, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let command = ToolCommand::for_device(kind, self.serial(), args);
        let failure = |detail: String| FlashError::CommandFailure {
            serial: self.serial().clone(),
            step,
            detail,
        };
        match self.ctx.tool.invoke(&command) {
            Ok(output) if output.success => Ok(()),
            Ok(output) => Err(failure(format!("`{command}`: {}", output.failure_detail()))),
            Err(e) => Err(failure(format!("`{command}`: {e}"))),
        }
    }

    fn fastboot<I, S>(&self, step: Step, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.command(ToolKind::Fastboot, step, args)
    }

    fn settle(&self) {
        self.ctx.sleeper.sleep(self.ctx.options.settle);
    }

    /// `fastboot reboot-bootloader` followed by the settle delay.
    fn reboot_bootloader(&self) -> Result<()> {
        self.fastboot(Step::RebootToBootloader, ["reboot-bootloader"])?;
        self.settle();
        Ok(())
    }

    fn enter_bootloader(&self) -> Result<()> {
        match self.reported_by {
            ToolKind::Adb => {
                self.command(ToolKind::Adb, Step::RebootToBootloader, ["reboot", "bootloader"])?;
                self.settle();
                Ok(())
            }
            ToolKind::Fastboot => self.reboot_bootloader(),
        }
    }

    fn provision_factory(&mut self, bundle: &ImageBundle) -> Result<()> {
        let artifacts = self.ctx.artifacts;
        self.enter_bootloader()?;
        self.advance(Phase::RebootedToBootloader);

        self.set_lock_state(Step::BootloaderUnlock, "unlock", "yes")?;
        self.advance(Phase::BootloaderUnlocked);

        self.flash_firmware(bundle)?;
        self.advance(Phase::FirmwarePartitionsFlashed);

        info!(serial = %self.serial(), "flashing OS and wiping userdata");
        self.fastboot(
            Step::UpdatePackageFlash,
            [
                OsString::from("-w"),
                "--skip-reboot".into(),
                "update".into(),
                bundle.update_package.clone().into(),
            ],
        )?;
        self.advance(Phase::UpdatePackageFlashed);

        self.reboot_bootloader()?;
        self.advance(Phase::RebootedToBootloaderPostFlash);

        if let Some(key) = &artifacts.sign_key {
            self.provision_key(key)?;
            self.advance(Phase::KeyProvisioned);

            if self.relock_exempt() {
                info!(serial = %self.serial(), "product is relock-exempt, leaving bootloader unlocked");
            } else {
                self.set_lock_state(Step::BootloaderRelock, "lock", "no")?;
                self.advance(Phase::BootloaderRelocked);
            }
        }

        self.fastboot(Step::Reboot, ["reboot"])?;
        self.advance(Phase::Rebooted);
        Ok(())
    }

    /// Runs `fastboot flashing <verb>` under the confirmation loop until
    /// `unlocked` reads `expected`.
    fn set_lock_state(&self, step: Step, verb: &str, expected: &str) -> Result<()> {
        let options = self.ctx.options;
        let confirmation = Confirmation::new(
            UNLOCKED_VAR,
            expected,
            options.confirm_attempts,
            options.confirm_interval,
        );
        let command = ToolCommand::fastboot(self.serial(), ["flashing", verb]);

        let mut prompted = false;
        let action = || {
            if !prompted {
                prompted = true;
                self.ctx.observer.awaiting_operator(self.serial(), step);
            }
            match self.ctx.tool.invoke(&command) {
                Ok(output) if output.success => {}
                Ok(output) => warn!(serial = %self.serial(), %step, "`{command}`: {}", output.failure_detail()),
                Err(e) => warn!(serial = %self.serial(), %step, "`{command}`: {e}"),
            }
        };
        let poll = |name: &str| poller::get_var(self.ctx.tool, self.serial(), name);

        match confirmation.run(action, poll, self.ctx.sleeper) {
            Ok(confirmed) => {
                info!(serial = %self.serial(), %step, ?confirmed, "confirmed");
                Ok(())
            }
            Err(unconfirmed) => Err(FlashError::ConfirmationTimeout {
                serial: self.serial().clone(),
                step,
                variable: confirmation.variable.clone(),
                expected: confirmation.expected.clone(),
                attempts: unconfirmed.polls,
            }),
        }
    }

    fn flash_firmware(&self, bundle: &ImageBundle) -> Result<()> {
        let reported = poller::get_var(self.ctx.tool, self.serial(), FIRMWARE_LAYOUT_VAR);
        let layout = FirmwareLayout::from_reported(reported.as_deref());
        info!(serial = %self.serial(), ?layout, "flashing firmware");

        match layout {
            FirmwareLayout::Monolithic => {
                let (bootloader, radio) = bundle.monolithic_firmware().ok_or_else(|| {
                    FlashError::FirmwareLayoutMissing {
                        serial: self.serial().clone(),
                        layout: "bootloader and radio",
                    }
                })?;
                self.flash_all_slots(Step::BootloaderFlash, "bootloader", bootloader)?;
                self.reboot_bootloader()?;
                self.flash_all_slots(Step::RadioFlash, "radio", radio)?;
                self.reboot_bootloader()?;
            }
            FirmwareLayout::Discrete => {
                if bundle.partitions.is_empty() {
                    return Err(FlashError::FirmwareLayoutMissing {
                        serial: self.serial().clone(),
                        layout: "discrete partition",
                    });
                }
                for image in &bundle.partitions {
                    self.flash_all_slots(Step::PartitionFlash, &image.partition, &image.path)?;
                }
            }
        }
        Ok(())
    }

    fn flash_all_slots(&self, step: Step, partition: &str, image: &Path) -> Result<()> {
        self.fastboot(
            step,
            [
                OsString::from("--slot"),
                "all".into(),
                "flash".into(),
                partition.into(),
                image.into(),
            ],
        )
    }

    /// Erase-then-flash of the custom AVB key. The erase may fail when no key
    /// was ever written; the flash may not.
    fn provision_key(&mut self, key: &Path) -> Result<()> {
        if let Err(e) = self.fastboot(Step::KeyErase, ["erase", AVB_KEY_PARTITION]) {
            warn!(serial = %self.serial(), "tolerating failed key erase: {e}");
            self.state.last_error = Some(e.to_string());
        }
        self.fastboot(
            Step::KeyFlash,
            [
                OsString::from("flash"),
                AVB_KEY_PARTITION.into(),
                key.into(),
            ],
        )
    }

    fn relock_exempt(&self) -> bool {
        if self.ctx.options.relock_exempt.is_empty() {
            return false;
        }
        poller::get_var(self.ctx.tool, self.serial(), PRODUCT_VAR)
            .is_some_and(|product| self.ctx.options.is_relock_exempt(&product))
    }

    fn sideload(&mut self, package: &Path) -> Result<()> {
        match self.reported_by {
            ToolKind::Adb => {
                self.command(ToolKind::Adb, Step::RebootToRecovery, ["reboot", "recovery"])?
            }
            ToolKind::Fastboot => self.fastboot(Step::RebootToRecovery, ["reboot", "recovery"])?,
        }
        self.advance(Phase::RebootedToRecovery);

        self.advance(Phase::WaitingForSideload);
        self.ctx.observer.awaiting_operator(self.serial(), Step::SideloadWait);
        let options = self.ctx.options;
        let wait = Confirmation::new(
            "state",
            SIDELOAD_STATE,
            options.sideload_attempts,
            options.sideload_interval,
        );
        if let Err(unconfirmed) = wait.wait(
            |_| poller::get_state(self.ctx.tool, self.serial()),
            self.ctx.sleeper,
        ) {
            return Err(FlashError::ConfirmationTimeout {
                serial: self.serial().clone(),
                step: Step::SideloadWait,
                variable: wait.variable,
                expected: wait.expected,
                attempts: unconfirmed.polls,
            });
        }

        info!(serial = %self.serial(), package = %package.display(), "sideloading");
        self.command(
            ToolKind::Adb,
            Step::Sideload,
            [OsString::from("sideload"), package.into()],
        )?;
        self.advance(Phase::OtaPushed);
        Ok(())
    }
}

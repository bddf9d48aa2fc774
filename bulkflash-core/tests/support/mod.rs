#![allow(dead_code)]

use bulkflash_core::Result;
use bulkflash_core::artifacts::{
    ArtifactResolver, ImageBundle, Images, PartitionImage, ProvisioningMode, RunArtifacts,
};
use bulkflash_core::confirm::Sleeper;
use bulkflash_core::device::{ConnectedDevice, DeviceSerial};
use bulkflash_core::task::{FlashOptions, Phase, Step, TaskObserver, TaskReport};
use bulkflash_core::tool::{DeviceTool, ToolCommand, ToolKind, ToolOutput};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// A simulated bootloader per serial.
#[derive(Clone, Debug)]
pub struct FakeDevice {
    pub unlocked: bool,
    /// Whether the operator answers the unlock/lock prompt.
    pub operator_confirms: bool,
    /// Whether the bootloader reports a type for the radio partition.
    pub monolithic_firmware: bool,
    pub product: String,
}

impl Default for FakeDevice {
    fn default() -> Self {
        Self {
            unlocked: false,
            operator_confirms: true,
            monolithic_firmware: true,
            product: "sargo".to_string(),
        }
    }
}

#[derive(Default)]
pub struct FakeTool {
    devices: Mutex<HashMap<DeviceSerial, FakeDevice>>,
    /// (serial, substring of the joined arguments) pairs that exit non-zero.
    failures: Mutex<HashSet<(String, String)>>,
    panics: Mutex<HashSet<String>>,
    calls: Mutex<Vec<ToolCommand>>,
}

impl FakeTool {
    pub fn with_device(self, serial: &str, device: FakeDevice) -> Self {
        self.devices
            .lock()
            .unwrap()
            .insert(DeviceSerial::new(serial), device);
        self
    }

    pub fn failing(self, serial: &str, args: &str) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert((serial.to_string(), args.to_string()));
        self
    }

    pub fn panicking(self, serial: &str) -> Self {
        self.panics.lock().unwrap().insert(serial.to_string());
        self
    }

    /// Joined arguments of every command sent to `serial`, in order.
    pub fn calls_for(&self, serial: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.serial.as_ref().map(DeviceSerial::as_str) == Some(serial))
            .map(|c| format!("{} {}", c.kind, joined(c)))
            .collect()
    }

    pub fn count(&self, serial: &str, needle: &str) -> usize {
        self.calls_for(serial)
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }

    pub fn all_calls(&self) -> Vec<ToolCommand> {
        self.calls.lock().unwrap().clone()
    }
}

fn joined(command: &ToolCommand) -> String {
    command
        .args
        .iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

impl DeviceTool for FakeTool {
    fn invoke(&self, command: &ToolCommand) -> io::Result<ToolOutput> {
        let serial = command
            .serial
            .as_ref()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default();
        let crash = self.panics.lock().unwrap().contains(&serial);
        if crash {
            panic!("simulated tool crash for {serial}");
        }
        self.calls.lock().unwrap().push(command.clone());

        let args = joined(command);
        let failing = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .any(|(s, pattern)| *s == serial && args.contains(pattern.as_str()));
        if failing {
            return Ok(ToolOutput::failed(format!("FAILED ({args})")));
        }

        let mut devices = self.devices.lock().unwrap();
        let Some(device) = devices.get_mut(&DeviceSerial::new(serial.as_str())) else {
            return Ok(ToolOutput::failed("error: device not found"));
        };

        let output = match (command.kind, args.as_str()) {
            (ToolKind::Fastboot, "getvar unlocked") => ToolOutput {
                success: true,
                stdout: String::new(),
                stderr: format!(
                    "unlocked: {}\nFinished. Total time: 0.001s\n",
                    if device.unlocked { "yes" } else { "no" }
                ),
            },
            (ToolKind::Fastboot, "getvar partition-type:radio") => ToolOutput {
                success: true,
                stdout: String::new(),
                stderr: if device.monolithic_firmware {
                    "partition-type:radio: raw\n".to_string()
                } else {
                    "partition-type:radio: \n".to_string()
                },
            },
            (ToolKind::Fastboot, "getvar product") => ToolOutput {
                success: true,
                stdout: String::new(),
                stderr: format!("product: {}\n", device.product),
            },
            (ToolKind::Fastboot, "flashing unlock") => {
                if device.operator_confirms {
                    device.unlocked = true;
                }
                ToolOutput::ok("")
            }
            (ToolKind::Fastboot, "flashing lock") => {
                if device.operator_confirms {
                    device.unlocked = false;
                }
                ToolOutput::ok("")
            }
            (ToolKind::Adb, "shell getprop ro.product.device") => {
                ToolOutput::ok(format!("{}\n", device.product))
            }
            (ToolKind::Adb, "get-state") => ToolOutput::ok("sideload\n"),
            _ => ToolOutput::ok(""),
        };
        Ok(output)
    }
}

#[derive(Default)]
pub struct RecordingSleeper {
    pub sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn count(&self) -> usize {
        self.sleeps.lock().unwrap().len()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub prompts: Mutex<Vec<(DeviceSerial, Step)>>,
    pub phases: Mutex<Vec<(DeviceSerial, Phase)>>,
    pub finished: Mutex<Vec<DeviceSerial>>,
}

impl TaskObserver for RecordingObserver {
    fn phase_entered(&self, serial: &DeviceSerial, phase: Phase) {
        self.phases.lock().unwrap().push((serial.clone(), phase));
    }

    fn awaiting_operator(&self, serial: &DeviceSerial, step: Step) {
        self.prompts.lock().unwrap().push((serial.clone(), step));
    }

    fn finished(&self, report: &TaskReport) {
        self.finished.lock().unwrap().push(report.serial.clone());
    }
}

pub struct FixedResolver(pub RunArtifacts);

impl ArtifactResolver for FixedResolver {
    fn resolve(&self, _model: &str, mode: ProvisioningMode) -> Result<RunArtifacts> {
        assert_eq!(mode, self.0.mode());
        Ok(self.0.clone())
    }
}

pub fn adb_device(serial: &str) -> ConnectedDevice {
    ConnectedDevice {
        serial: DeviceSerial::new(serial),
        reported_by: ToolKind::Adb,
        state: "device".to_string(),
    }
}

pub fn fastboot_device(serial: &str) -> ConnectedDevice {
    ConnectedDevice {
        serial: DeviceSerial::new(serial),
        reported_by: ToolKind::Fastboot,
        state: "fastboot".to_string(),
    }
}

pub fn factory_artifacts(sign_key: bool) -> RunArtifacts {
    RunArtifacts {
        images: Images::Factory(ImageBundle {
            bootloader: Some(PathBuf::from("/img/bootloader-sargo.img")),
            radio: Some(PathBuf::from("/img/radio-sargo.img")),
            update_package: PathBuf::from("/img/sargo-img-1.zip"),
            partitions: vec![
                PartitionImage {
                    partition: "abl".to_string(),
                    path: PathBuf::from("/img/partitions/abl.img"),
                },
                PartitionImage {
                    partition: "modem".to_string(),
                    path: PathBuf::from("/img/partitions/modem.img"),
                },
            ],
        }),
        sign_key: sign_key.then(|| PathBuf::from("/img/avb_pkmd.bin")),
    }
}

pub fn ota_artifacts() -> RunArtifacts {
    RunArtifacts {
        images: Images::Ota(PathBuf::from("/img/sargo-ota-1.zip")),
        sign_key: None,
    }
}

pub fn fast_options() -> FlashOptions {
    FlashOptions {
        settle: Duration::from_secs(5),
        confirm_interval: Duration::from_secs(30),
        confirm_attempts: 3,
        sideload_interval: Duration::from_secs(5),
        sideload_attempts: 4,
        relock_exempt: Vec::new(),
    }
}

pub fn assert_strictly_increasing(phases: &[Phase]) {
    assert!(
        phases.windows(2).all(|w| w[0] < w[1]),
        "phases not strictly increasing: {phases:?}"
    );
}

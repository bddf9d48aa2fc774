//! The core, UI-agnostic library for the `bulkflash` provisioning utility.
//!
//! `bulkflash-core` drives a fleet of USB-attached Android devices through
//! unlock, flash, wipe, relock and reboot by shelling out to `adb` and
//! `fastboot`. It can be used by any front-end; the `bulkflash` CLI is one.
//!
//! The library is structured into several key modules:
//! - [`tool`]: the [`tool::DeviceTool`] seam and its process-backed implementation.
//! - [`device`]: device serials and enumeration of connected devices.
//! - [`poller`]: single reads of bootloader variables and device properties.
//! - [`confirm`]: the bounded retry loop for operations a human confirms on
//!   the device.
//! - [`artifacts`]: locating the images a run flashes.
//! - [`task`]: the per-device state machine.
//! - [`fleet`]: concurrent fan-out of one task per device.
//!
//! Progress is reported through the [`task::TaskObserver`] trait, so the
//! calling application can display it however it chooses.
//!
//! ## Example: Flashing Every Connected Device
//!
//! ```rust,no_run
//! use bulkflash_core::artifacts::{DirectoryResolver, ProvisioningMode};
//! use bulkflash_core::device;
//! use bulkflash_core::fleet::Fleet;
//! use bulkflash_core::tool::ProcessTool;
//!
//! fn main() -> Result<(), bulkflash_core::FlashError> {
//!     let tool = ProcessTool::default();
//!     tool.check()?;
//!
//!     let devices = device::enumerate(&tool)?;
//!     let report = Fleet::new(&tool).run(
//!         &devices,
//!         ProvisioningMode::FactoryImage,
//!         &DirectoryResolver::new("."),
//!     )?;
//!
//!     for task in &report.tasks {
//!         match task.outcome.reason() {
//!             None => println!("{}: done", task.serial),
//!             Some(reason) => println!("{}: failed at {reason}", task.serial),
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod artifacts;
pub mod confirm;
pub mod device;
pub mod error;
pub mod fleet;
pub mod poller;
pub mod task;
pub mod tool;

pub use error::{FlashError, Result};

//! Error taxonomy for flashing runs.
//!
//! Errors fall into two scopes. Run-level errors ([`FlashError::PrerequisiteMissing`],
//! [`FlashError::ToolUnavailable`], [`FlashError::NoDevices`], [`FlashError::Io`])
//! stop a run before any device task is spawned. Device-level errors
//! ([`FlashError::CommandFailure`], [`FlashError::ConfirmationTimeout`],
//! [`FlashError::FirmwareLayoutMissing`], [`FlashError::TaskPanicked`]) end only
//! the task of the device they name.
use crate::device::DeviceSerial;
use crate::task::Step;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlashError>;

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("missing prerequisite: {what}")]
    PrerequisiteMissing { what: String },

    #[error("device tool `{tool}` is not usable: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("no device connected")]
    NoDevices,

    #[error("cannot read artifact directory {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("device {serial}: {step} failed: {detail}")]
    CommandFailure {
        serial: DeviceSerial,
        step: Step,
        detail: String,
    },

    #[error(
        "device {serial}: {step} not confirmed, `{variable}` never became \
         `{expected}` after {attempts} polls"
    )]
    ConfirmationTimeout {
        serial: DeviceSerial,
        step: Step,
        variable: String,
        expected: String,
        attempts: u32,
    },

    #[error("device {serial}: task panicked: {message}")]
    TaskPanicked {
        serial: DeviceSerial,
        message: String,
    },

    #[error("device {serial}: no {layout} firmware images were resolved for this run")]
    FirmwareLayoutMissing {
        serial: DeviceSerial,
        layout: &'static str,
    },
}

impl FlashError {
    pub(crate) fn missing(what: impl Into<String>) -> Self {
        FlashError::PrerequisiteMissing { what: what.into() }
    }

    /// Returns `true` if this error ends the whole run rather than a single
    /// device task.
    pub fn is_run_level(&self) -> bool {
        matches!(
            self,
            FlashError::PrerequisiteMissing { .. }
                | FlashError::ToolUnavailable { .. }
                | FlashError::NoDevices
                | FlashError::Io { .. }
        )
    }

    /// The step a device-level error was raised in.
    pub fn step(&self) -> Option<Step> {
        match self {
            FlashError::CommandFailure { step, .. }
            | FlashError::ConfirmationTimeout { step, .. } => Some(*step),
            FlashError::FirmwareLayoutMissing { .. } => Some(Step::FirmwareFlash),
            _ => None,
        }
    }
}

//! Crate-level error taxonomy.
//!
//! Sensor faults and single device timeouts are handled inside the control
//! loop and only show up as [`crate::core::sample::TickStatus`] values. What
//! reaches the trial-management layer is listed here. Running out of trials
//! without convergence is not an error; see
//! [`crate::trial::sequencer::SessionOutcome::Exhausted`].

use thiserror::Error;

use crate::device::DeviceError;
use crate::persist::PersistError;
use crate::trial::staircase::StaircaseError;

#[derive(Debug, Error)]
pub enum ExoError {
    /// Configuration surface is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A profile would violate `onset < peak < end <= 100` or the admissible range.
    #[error("invalid profile parameter: {0}")]
    InvalidParameter(String),

    /// Device I/O kept timing out; fatal to the current trial.
    #[error("device fault after {consecutive_timeouts} consecutive timeouts: {last_error}")]
    DeviceFault {
        consecutive_timeouts: u32,
        last_error: DeviceError,
    },

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Staircase(#[from] StaircaseError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    /// Gait lock was lost and the comparison window never filled.
    #[error("comparison window incomplete: {0}")]
    WindowIncomplete(String),

    /// The response source closed before supplying an answer.
    #[error("response input closed")]
    ResponseClosed,

    /// The control thread exited or stopped answering.
    #[error("control task: {0}")]
    ControlTask(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ExoError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    pub fn is_device_fault(&self) -> bool {
        matches!(self, Self::DeviceFault { .. })
    }
}

//! Device seam: one trait behind which the simulated boot and the vendor
//! link both sit. All I/O is bounded by a caller-supplied timeout so the
//! control loop can never block past its tick.

pub mod command_guard;
pub mod link;
pub mod sim;

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::core::sample::InertialSample;

pub use command_guard::{CommandGuard, CommandGuardMeter, CommandGuardStats};
pub use link::{ActuatorLink, LinkDevice, RawFrame};
pub use sim::{FaultScript, SimulatedDevice};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    Read,
    Write,
    Zero,
    Reconnect,
}

impl fmt::Display for DeviceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Zero => "zero",
            Self::Reconnect => "reconnect",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("{op} timed out after {after:?}")]
    Timeout { op: DeviceOp, after: Duration },
    #[error("device disconnected")]
    Disconnected,
    #[error("device rejected request: {0}")]
    Rejected(String),
    #[error("{0} not supported by this device")]
    Unsupported(&'static str),
}

impl DeviceError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Acknowledgement of a torque command.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CommandAck {
    /// Motor current reported by the driver, in amperes.
    pub measured_current_a: Option<f64>,
}

/// Offsets captured while the wearer stands still.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Baseline {
    pub gyro_z_bias: f64,
    pub current_offset_a: f64,
}

pub trait Device: Send {
    fn read_sample(&mut self, timeout: Duration) -> Result<InertialSample, DeviceError>;

    /// Command an ankle torque in Nm. Zero means "no assistance", not "no tension".
    fn write_command(&mut self, torque_nm: f64, timeout: Duration)
    -> Result<CommandAck, DeviceError>;

    fn zero(&mut self) -> Result<Baseline, DeviceError>;

    fn reconnect(&mut self) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("reconnect"))
    }
}

impl<D: Device + ?Sized> Device for Box<D> {
    fn read_sample(&mut self, timeout: Duration) -> Result<InertialSample, DeviceError> {
        (**self).read_sample(timeout)
    }

    fn write_command(
        &mut self,
        torque_nm: f64,
        timeout: Duration,
    ) -> Result<CommandAck, DeviceError> {
        (**self).write_command(torque_nm, timeout)
    }

    fn zero(&mut self) -> Result<Baseline, DeviceError> {
        (**self).zero()
    }

    fn reconnect(&mut self) -> Result<(), DeviceError> {
        (**self).reconnect()
    }
}

impl<D: Device + ?Sized> Device for &mut D {
    fn read_sample(&mut self, timeout: Duration) -> Result<InertialSample, DeviceError> {
        (**self).read_sample(timeout)
    }

    fn write_command(
        &mut self,
        torque_nm: f64,
        timeout: Duration,
    ) -> Result<CommandAck, DeviceError> {
        (**self).write_command(torque_nm, timeout)
    }

    fn zero(&mut self) -> Result<Baseline, DeviceError> {
        (**self).zero()
    }

    fn reconnect(&mut self) -> Result<(), DeviceError> {
        (**self).reconnect()
    }
}

//! Per-sample and per-tick records exchanged between the device, the
//! control loop and the persistence layer.

use serde::{Deserialize, Serialize};

use crate::core::timebase::Tick;

/// One inertial reading from the device transport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InertialSample {
    /// Monotonic device time in seconds.
    pub timestamp_s: f64,
    /// Angular rate about the sagittal axis (deg/s after device scaling).
    pub gyro_z: f64,
}

impl InertialSample {
    pub fn new(timestamp_s: f64, gyro_z: f64) -> Self {
        Self {
            timestamp_s,
            gyro_z,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.timestamp_s.is_finite() && self.gyro_z.is_finite()
    }
}

/// What happened on a control tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TickStatus {
    /// Phase known; torque evaluated from the active profile.
    Active,
    /// Phase known but no profile published (warm-up or between trials).
    Idle,
    /// No stride estimate yet; zero torque.
    AwaitingPhase,
    /// Estimator fault; zero torque.
    SensorFault,
    /// Device I/O timed out on this tick; zero torque attempted.
    DeviceTimeout,
    /// Consecutive timeouts exceeded the limit on this tick.
    DeviceFault,
    /// Loop is faulted and waiting for reconnection.
    Halted,
}

impl TickStatus {
    pub fn is_fault(self) -> bool {
        matches!(
            self,
            Self::SensorFault | Self::DeviceTimeout | Self::DeviceFault | Self::Halted
        )
    }
}

/// One record per control tick. Append-only; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSample {
    pub tick: Tick,
    pub timestamp_s: f64,
    pub trial_index: Option<u32>,
    /// Percent of the gait cycle, `-1` while undetermined.
    pub percent_gait: f64,
    pub commanded_torque: f64,
    pub measured_current: Option<f64>,
    pub gyro_z: Option<f64>,
    pub stride_estimate_s: Option<f64>,
    pub heel_strike: bool,
    pub status: TickStatus,
}

//! Deterministic simulated boot.
//!
//! Time advances by one sample period per `read_sample` call, whether or not
//! the read succeeds, so timestamps stay strictly increasing across faults.
//! The gyro trace is a swing-phase positive lobe followed by a sharp
//! negative spike centred on each heel strike.

use std::collections::BTreeSet;
use std::f64::consts::PI;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::SimulationConfig;
use crate::core::sample::InertialSample;
use crate::device::{Baseline, CommandAck, Device, DeviceError, DeviceOp};

const SWING_START: f64 = 0.60;
const SWING_LEN: f64 = 0.32;
const SWING_PEAK: f64 = 8.0;
const STRIKE_HALF_WIDTH: f64 = 0.03;
const STRIKE_PEAK: f64 = 15.0;

/// Scripted faults, indexed by 0-based read/write call count.
#[derive(Debug, Clone, Default)]
pub struct FaultScript {
    pub read_timeouts: BTreeSet<u64>,
    pub write_timeouts: BTreeSet<u64>,
    /// Reads returning a non-finite gyro value.
    pub invalid_reads: BTreeSet<u64>,
    /// From this read on, every read and write times out until `reconnect`.
    pub stall_from_read: Option<u64>,
}

impl FaultScript {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn read_timeouts(reads: impl IntoIterator<Item = u64>) -> Self {
        Self {
            read_timeouts: reads.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn stall_from(read: u64) -> Self {
        Self {
            stall_from_read: Some(read),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct SimulatedDevice {
    cfg: SimulationConfig,
    rng: StdRng,
    sample_period_s: f64,
    t: f64,
    stride_start_s: f64,
    stride_len_s: f64,
    strides: u64,
    reads: u64,
    writes: u64,
    stalled: bool,
    faults: FaultScript,
    last_command_nm: Option<f64>,
    reconnects: u32,
}

impl SimulatedDevice {
    pub fn new(cfg: SimulationConfig, sample_period_s: f64) -> Self {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let stride_len_s = Self::draw_stride(&cfg, &mut rng);
        Self {
            // Start mid-stance so the first swing lobe arrives quickly.
            stride_start_s: -0.3 * stride_len_s,
            stride_len_s,
            cfg,
            rng,
            sample_period_s,
            t: 0.0,
            strides: 0,
            reads: 0,
            writes: 0,
            stalled: false,
            faults: FaultScript::default(),
            last_command_nm: None,
            reconnects: 0,
        }
    }

    pub fn with_faults(mut self, faults: FaultScript) -> Self {
        self.faults = faults;
        self
    }

    fn draw_stride(cfg: &SimulationConfig, rng: &mut StdRng) -> f64 {
        cfg.stride_s + rng.random_range(-1.0..1.0) * cfg.stride_jitter_s
    }

    /// Gyro shape at stride fraction `s` in `[0, 1)`, without noise or bias.
    pub fn gyro_shape(s: f64) -> f64 {
        if (SWING_START..SWING_START + SWING_LEN).contains(&s) {
            return SWING_PEAK * (PI * (s - SWING_START) / SWING_LEN).sin();
        }
        let width = 2.0 * STRIKE_HALF_WIDTH;
        if s >= 1.0 - STRIKE_HALF_WIDTH {
            -STRIKE_PEAK * (PI * (s - (1.0 - STRIKE_HALF_WIDTH)) / width).sin()
        } else if s < STRIKE_HALF_WIDTH {
            -STRIKE_PEAK * (PI * (s + STRIKE_HALF_WIDTH) / width).sin()
        } else {
            0.0
        }
    }

    fn advance(&mut self) {
        self.t += self.sample_period_s;
        while self.t - self.stride_start_s >= self.stride_len_s {
            self.stride_start_s += self.stride_len_s;
            self.stride_len_s = Self::draw_stride(&self.cfg, &mut self.rng);
            self.strides += 1;
        }
    }

    fn gyro_now(&mut self) -> f64 {
        let s = (self.t - self.stride_start_s) / self.stride_len_s;
        let noise = self.rng.random_range(-1.0..1.0) * self.cfg.gyro_noise;
        Self::gyro_shape(s) + noise + self.cfg.gyro_bias
    }

    pub fn time_s(&self) -> f64 {
        self.t
    }

    /// Heel strikes simulated so far.
    pub fn strides(&self) -> u64 {
        self.strides
    }

    pub fn last_command_nm(&self) -> Option<f64> {
        self.last_command_nm
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }
}

impl Device for SimulatedDevice {
    fn read_sample(&mut self, timeout: Duration) -> Result<InertialSample, DeviceError> {
        let idx = self.reads;
        self.reads += 1;
        self.advance();
        if self.faults.stall_from_read.is_some_and(|from| idx >= from) && !self.stalled {
            debug!(target: "device", "sim stalled at read {idx}");
            self.stalled = true;
            self.faults.stall_from_read = None;
        }
        if self.stalled || self.faults.read_timeouts.contains(&idx) {
            return Err(DeviceError::Timeout {
                op: DeviceOp::Read,
                after: timeout,
            });
        }
        let gyro_z = if self.faults.invalid_reads.contains(&idx) {
            f64::NAN
        } else {
            self.gyro_now()
        };
        Ok(InertialSample::new(self.t, gyro_z))
    }

    fn write_command(
        &mut self,
        torque_nm: f64,
        timeout: Duration,
    ) -> Result<CommandAck, DeviceError> {
        let idx = self.writes;
        self.writes += 1;
        if self.stalled || self.faults.write_timeouts.contains(&idx) {
            return Err(DeviceError::Timeout {
                op: DeviceOp::Write,
                after: timeout,
            });
        }
        self.last_command_nm = Some(torque_nm);
        Ok(CommandAck {
            measured_current_a: Some(torque_nm * self.cfg.current_per_nm),
        })
    }

    fn zero(&mut self) -> Result<Baseline, DeviceError> {
        if self.stalled {
            return Err(DeviceError::Disconnected);
        }
        Ok(Baseline {
            gyro_z_bias: self.cfg.gyro_bias,
            current_offset_a: 0.0,
        })
    }

    fn reconnect(&mut self) -> Result<(), DeviceError> {
        self.stalled = false;
        self.reconnects += 1;
        debug!(target: "device", "sim reconnected ({} total)", self.reconnects);
        Ok(())
    }
}

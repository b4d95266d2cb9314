//! One control tick: read, estimate, evaluate, command, record.
//!
//! Every tick yields exactly one [`ControlSample`], including ticks on which
//! the device timed out, so the sample stream accounts for all of them.
//! A newly set profile takes effect at the next heel strike; withdrawing the
//! profile takes effect immediately.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{ControlConfig, GaitConfig};
use crate::control::handoff::ActiveProfile;
use crate::core::gait::{GaitPhase, GaitPhaseEstimator, SensorFault};
use crate::core::profile::TorqueProfile;
use crate::core::sample::{ControlSample, InertialSample, TickStatus};
use crate::core::timebase::{Tick, Timebase};
use crate::device::{Baseline, CommandGuard, Device, DeviceError};
use crate::error::ExoError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub ticks: u64,
    pub active_ticks: u64,
    pub sensor_faults: u64,
    pub timeouts: u64,
    pub device_faults: u64,
    pub heel_strikes: u64,
}

#[derive(Debug)]
pub struct ControlLoop {
    timebase: Timebase,
    io_timeout: Duration,
    max_consecutive_timeouts: u32,
    estimator: GaitPhaseEstimator,
    profile: TorqueProfile,
    guard: CommandGuard,
    baseline: Baseline,
    active: Option<ActiveProfile>,
    pending: Option<ActiveProfile>,
    tick: Tick,
    last_timestamp_s: Option<f64>,
    consecutive_timeouts: u32,
    last_error: Option<DeviceError>,
    halted: bool,
    last_sensor_fault: Option<SensorFault>,
    stats: LoopStats,
}

impl ControlLoop {
    /// Worst case per tick: a read, a failed write and the fail-safe write.
    /// `SessionConfig::validate` sizes the I/O timeout against this.
    pub const MAX_IO_CALLS_PER_TICK: u32 = 3;

    pub fn new(control: &ControlConfig, gait: GaitConfig) -> Self {
        Self {
            timebase: Timebase::new(control.frequency_hz),
            io_timeout: control.io_timeout(),
            max_consecutive_timeouts: control.max_consecutive_timeouts.max(1),
            estimator: GaitPhaseEstimator::new(gait),
            profile: TorqueProfile::new(control.profile_shape),
            guard: CommandGuard::new(control.max_torque_nm),
            baseline: Baseline::default(),
            active: None,
            pending: None,
            tick: 0,
            last_timestamp_s: None,
            consecutive_timeouts: 0,
            last_error: None,
            halted: false,
            last_sensor_fault: None,
            stats: LoopStats::default(),
        }
    }

    pub fn with_guard(mut self, guard: CommandGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn timebase(&self) -> Timebase {
        self.timebase
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub fn set_baseline(&mut self, baseline: Baseline) {
        self.baseline = baseline;
    }

    /// Zero the device and adopt the baseline.
    pub fn calibrate<D: Device + ?Sized>(&mut self, device: &mut D) -> Result<Baseline, ExoError> {
        let baseline = device.zero()?;
        self.baseline = baseline;
        Ok(baseline)
    }

    /// Schedule a profile (from the next heel strike) or withdraw it (now).
    pub fn set_profile(&mut self, update: Option<ActiveProfile>) {
        match update {
            Some(profile) => self.pending = Some(profile),
            None => {
                self.pending = None;
                self.active = None;
            }
        }
    }

    pub fn active_trial(&self) -> Option<u32> {
        self.active.as_ref().map(|a| a.trial_index)
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn estimator(&self) -> &GaitPhaseEstimator {
        &self.estimator
    }

    pub fn guard_mut(&mut self) -> &mut CommandGuard {
        &mut self.guard
    }

    /// The fault raised when consecutive timeouts reached the limit.
    pub fn device_fault(&self) -> Option<ExoError> {
        if !self.halted {
            return None;
        }
        Some(ExoError::DeviceFault {
            consecutive_timeouts: self.consecutive_timeouts,
            last_error: self
                .last_error
                .clone()
                .unwrap_or(DeviceError::Disconnected),
        })
    }

    /// Leave the faulted state after the device was reconnected. Gait lock
    /// is re-acquired from scratch.
    pub fn reset_fault(&mut self) {
        if self.halted {
            info!(target: "control", "fault cleared at tick {}", self.tick);
        }
        self.halted = false;
        self.consecutive_timeouts = 0;
        self.last_error = None;
        self.active = None;
        self.pending = None;
        self.estimator.reset();
    }

    pub fn run_tick<D: Device + ?Sized>(&mut self, device: &mut D) -> ControlSample {
        let tick = self.tick;
        self.tick += 1;
        self.stats.ticks += 1;

        if self.halted {
            // Keep the clock and the gyro trace going while waiting for reconnection.
            let read = device.read_sample(self.io_timeout).ok();
            let _ = device.write_command(0.0, self.io_timeout);
            let timestamp_s = match read {
                Some(raw) if self.is_after_last(raw.timestamp_s) => {
                    self.last_timestamp_s = Some(raw.timestamp_s);
                    raw.timestamp_s
                }
                _ => self.next_timestamp(),
            };
            let gyro_z = read
                .map(|raw| raw.gyro_z - self.baseline.gyro_z_bias)
                .filter(|g| g.is_finite());
            return self.record(tick, timestamp_s, 0.0, None, gyro_z, false, TickStatus::Halted);
        }

        let raw = match device.read_sample(self.io_timeout) {
            Ok(raw) => raw,
            Err(err) => return self.on_io_error(device, tick, err, None, None, false),
        };
        let sample = InertialSample::new(raw.timestamp_s, raw.gyro_z - self.baseline.gyro_z_bias);
        let timestamp_s = if self.is_after_last(sample.timestamp_s) {
            sample.timestamp_s
        } else {
            self.next_timestamp()
        };
        let gyro_z = sample.gyro_z.is_finite().then_some(sample.gyro_z);

        let phase = self.estimator.update(&sample);
        let heel_strike = self.estimator.heel_strike_detected();
        if heel_strike {
            self.stats.heel_strikes += 1;
            if let Some(next) = self.pending.take() {
                debug!(target: "control", "trial {} profile engaged at tick {tick}", next.trial_index);
                self.active = Some(next);
            }
        }

        let (status, torque) = match phase {
            Err(fault) => {
                self.stats.sensor_faults += 1;
                let repeated = self
                    .last_sensor_fault
                    .is_some_and(|prev| std::mem::discriminant(&prev) == std::mem::discriminant(&fault));
                if !repeated {
                    debug!(target: "control", "sensor fault at tick {tick}: {fault}");
                }
                self.last_sensor_fault = Some(fault);
                (TickStatus::SensorFault, 0.0)
            }
            Ok(GaitPhase::Unknown) => {
                self.last_sensor_fault = None;
                (TickStatus::AwaitingPhase, 0.0)
            }
            Ok(GaitPhase::Stride(pct) | GaitPhase::Overrun(pct)) => {
                self.last_sensor_fault = None;
                match &self.active {
                    Some(active) => {
                        let torque = self.profile.evaluate(pct, &active.params);
                        (TickStatus::Active, self.guard.apply(torque))
                    }
                    None => (TickStatus::Idle, 0.0),
                }
            }
        };
        if status == TickStatus::Active {
            self.stats.active_ticks += 1;
        }

        match device.write_command(torque, self.io_timeout) {
            Ok(ack) => {
                self.consecutive_timeouts = 0;
                self.last_timestamp_s = Some(timestamp_s);
                let current = ack
                    .measured_current_a
                    .map(|a| a - self.baseline.current_offset_a);
                self.record(tick, timestamp_s, torque, current, gyro_z, heel_strike, status)
            }
            Err(err) => self.on_io_error(device, tick, err, Some(timestamp_s), gyro_z, heel_strike),
        }
    }

    fn on_io_error<D: Device + ?Sized>(
        &mut self,
        device: &mut D,
        tick: Tick,
        err: DeviceError,
        timestamp_s: Option<f64>,
        gyro_z: Option<f64>,
        heel_strike: bool,
    ) -> ControlSample {
        self.consecutive_timeouts += 1;
        self.stats.timeouts += 1;
        // Best-effort fail-safe; the outcome does not change the record.
        let _ = device.write_command(0.0, self.io_timeout);
        let timestamp_s = match timestamp_s {
            Some(t) => {
                self.last_timestamp_s = Some(t);
                t
            }
            None => self.next_timestamp(),
        };

        let status = if self.consecutive_timeouts >= self.max_consecutive_timeouts {
            self.halted = true;
            self.active = None;
            self.pending = None;
            self.stats.device_faults += 1;
            warn!(
                target: "control",
                "device fault at tick {tick}: {} consecutive I/O failures, last: {err}",
                self.consecutive_timeouts
            );
            TickStatus::DeviceFault
        } else {
            debug!(target: "control", "device I/O failed at tick {tick}: {err}");
            TickStatus::DeviceTimeout
        };
        self.last_error = Some(err);
        self.record(tick, timestamp_s, 0.0, None, gyro_z, heel_strike, status)
    }

    fn is_after_last(&self, t: f64) -> bool {
        t.is_finite() && self.last_timestamp_s.is_none_or(|last| t > last)
    }

    fn next_timestamp(&mut self) -> f64 {
        let t = self
            .last_timestamp_s
            .map_or(0.0, |t| t + self.timebase.period_sec());
        self.last_timestamp_s = Some(t);
        t
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        tick: Tick,
        timestamp_s: f64,
        commanded_torque: f64,
        measured_current: Option<f64>,
        gyro_z: Option<f64>,
        heel_strike: bool,
        status: TickStatus,
    ) -> ControlSample {
        let state = self.estimator.state();
        ControlSample {
            tick,
            timestamp_s,
            trial_index: self.active_trial(),
            percent_gait: state.percent_gait,
            commanded_torque,
            measured_current,
            gyro_z,
            stride_estimate_s: state.stride_estimate_s,
            heel_strike,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::core::profile::ProfileParameters;
    use crate::device::{FaultScript, SimulatedDevice};
    use std::sync::Arc;

    fn sim(faults: FaultScript) -> SimulatedDevice {
        let cfg = SimulationConfig {
            stride_s: 1.0,
            stride_jitter_s: 0.0,
            gyro_noise: 0.0,
            ..SimulationConfig::default()
        };
        SimulatedDevice::new(cfg, 0.01).with_faults(faults)
    }

    fn control_loop() -> ControlLoop {
        ControlLoop::new(&ControlConfig::default(), GaitConfig::default())
    }

    fn profile(trial: u32) -> ActiveProfile {
        let params = ProfileParameters::new(26.0, 25.3, 10.3, 15.75).unwrap();
        ActiveProfile::new(trial, Arc::new(params))
    }

    #[test]
    fn zero_torque_until_phase_known() {
        let mut dev = sim(FaultScript::none());
        let mut cl = control_loop();
        cl.set_profile(Some(profile(0)));
        let first = cl.run_tick(&mut dev);
        assert_eq!(first.status, TickStatus::AwaitingPhase);
        assert_eq!(first.percent_gait, -1.0);
        assert_eq!(first.commanded_torque, 0.0);
        assert_eq!(first.trial_index, None);
    }

    #[test]
    fn profile_engages_at_heel_strike_and_assists() {
        let mut dev = sim(FaultScript::none());
        let mut cl = control_loop();
        // Two strides to seed the estimate.
        let mut ticks = 0;
        while cl.estimator().stride_estimate_s().is_none() {
            let s = cl.run_tick(&mut dev);
            assert_eq!(s.commanded_torque, 0.0);
            ticks += 1;
            assert!(ticks < 500);
        }
        cl.set_profile(Some(profile(4)));
        let mut engaged_at = None;
        let mut peak: f64 = 0.0;
        for _ in 0..250 {
            let s = cl.run_tick(&mut dev);
            if s.trial_index == Some(4) && engaged_at.is_none() {
                assert!(s.heel_strike, "profile must engage on a heel strike");
                engaged_at = Some(s.tick);
            }
            if s.trial_index.is_none() {
                assert_eq!(s.commanded_torque, 0.0);
            }
            peak = peak.max(s.commanded_torque);
        }
        assert!(engaged_at.is_some());
        assert!(peak > 14.0 && peak <= 15.75, "peak {peak}");
        assert!(cl.stats().active_ticks > 0);
    }

    #[test]
    fn withdrawal_is_immediate() {
        let mut dev = sim(FaultScript::none());
        let mut cl = control_loop();
        for _ in 0..300 {
            cl.run_tick(&mut dev);
        }
        cl.set_profile(Some(profile(1)));
        while cl.active_trial().is_none() {
            cl.run_tick(&mut dev);
        }
        cl.set_profile(None);
        let s = cl.run_tick(&mut dev);
        assert_eq!(s.trial_index, None);
        assert_eq!(s.commanded_torque, 0.0);
        assert_eq!(s.status, TickStatus::Idle);
    }

    #[test]
    fn single_timeout_is_transient() {
        let mut dev = sim(FaultScript::read_timeouts([5]));
        let mut cl = control_loop();
        let samples: Vec<_> = (0..10).map(|_| cl.run_tick(&mut dev)).collect();
        assert_eq!(samples[5].status, TickStatus::DeviceTimeout);
        assert_eq!(samples[5].commanded_torque, 0.0);
        assert!((samples[5].timestamp_s - 0.06).abs() < 1e-9);
        assert_eq!(samples[6].status, TickStatus::AwaitingPhase);
        assert!(!cl.is_halted());
        assert!(cl.device_fault().is_none());
    }

    #[test]
    fn halted_until_reset() {
        let mut dev = sim(FaultScript::stall_from(3));
        let mut cl = control_loop();
        let samples: Vec<_> = (0..8).map(|_| cl.run_tick(&mut dev)).collect();
        assert_eq!(samples[5].status, TickStatus::DeviceFault);
        assert!(samples[6..].iter().all(|s| s.status == TickStatus::Halted));
        assert!(samples.iter().all(|s| s.commanded_torque == 0.0));
        assert!(matches!(
            cl.device_fault(),
            Some(ExoError::DeviceFault { consecutive_timeouts: 3, .. })
        ));

        dev.reconnect().unwrap();
        cl.reset_fault();
        let s = cl.run_tick(&mut dev);
        assert_eq!(s.status, TickStatus::AwaitingPhase);
        assert!(s.timestamp_s > samples[7].timestamp_s);
        assert!(samples.windows(2).all(|w| w[1].timestamp_s > w[0].timestamp_s));
    }

    #[test]
    fn ticks_are_consecutive() {
        let mut dev = sim(FaultScript::read_timeouts([2, 3]));
        let mut cl = control_loop();
        let ticks: Vec<_> = (0..6).map(|_| cl.run_tick(&mut dev).tick).collect();
        assert_eq!(ticks, vec![0, 1, 2, 3, 4, 5]);
    }
}

use std::sync::Arc;
use std::time::Duration;

use exo_perception::config::{ControlConfig, GaitConfig, SessionConfig, SimulationConfig};
use exo_perception::control::{ActiveProfile, ControlLoop};
use exo_perception::core::sample::{InertialSample, TickStatus};
use exo_perception::device::{
    Baseline, CommandAck, Device, DeviceError, DeviceOp, SimulatedDevice,
};
use exo_perception::error::ExoError;

/// Simulated boot whose reads can be made to time out on demand; records
/// every torque command it receives.
struct Flaky {
    inner: SimulatedDevice,
    fail_reads: u32,
    commands: Vec<f64>,
}

impl Flaky {
    fn new() -> Self {
        let cfg = SimulationConfig {
            stride_s: 1.0,
            stride_jitter_s: 0.0,
            gyro_noise: 0.0,
            ..SimulationConfig::default()
        };
        Self {
            inner: SimulatedDevice::new(cfg, 0.01),
            fail_reads: 0,
            commands: Vec::new(),
        }
    }
}

impl Device for Flaky {
    fn read_sample(&mut self, timeout: Duration) -> Result<InertialSample, DeviceError> {
        let sample = self.inner.read_sample(timeout)?;
        if self.fail_reads > 0 {
            self.fail_reads -= 1;
            return Err(DeviceError::Timeout {
                op: DeviceOp::Read,
                after: timeout,
            });
        }
        Ok(sample)
    }

    fn write_command(
        &mut self,
        torque_nm: f64,
        timeout: Duration,
    ) -> Result<CommandAck, DeviceError> {
        self.commands.push(torque_nm);
        self.inner.write_command(torque_nm, timeout)
    }

    fn zero(&mut self) -> Result<Baseline, DeviceError> {
        self.inner.zero()
    }

    fn reconnect(&mut self) -> Result<(), DeviceError> {
        self.fail_reads = 0;
        self.inner.reconnect()
    }
}

/// Loop with a profile engaged and torque flowing.
fn assisting_loop(dev: &mut Flaky) -> ControlLoop {
    let mut lp = ControlLoop::new(&ControlConfig::default(), GaitConfig::default());
    let params = SessionConfig::default().base_profile().unwrap();
    for _ in 0..300 {
        lp.run_tick(dev);
    }
    assert!(lp.estimator().stride_estimate_s().is_some());
    lp.set_profile(Some(ActiveProfile::new(0, Arc::new(params))));
    for _ in 0..300 {
        let s = lp.run_tick(dev);
        if s.status == TickStatus::Active && s.commanded_torque > 1.0 {
            return lp;
        }
    }
    panic!("profile never produced torque");
}

#[test]
fn three_timeouts_fault_the_loop_with_zero_torque() {
    let mut dev = Flaky::new();
    let mut lp = assisting_loop(&mut dev);

    dev.fail_reads = 3;
    dev.commands.clear();
    let statuses: Vec<TickStatus> = (0..3)
        .map(|_| {
            let s = lp.run_tick(&mut dev);
            assert_eq!(s.commanded_torque, 0.0);
            s.status
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            TickStatus::DeviceTimeout,
            TickStatus::DeviceTimeout,
            TickStatus::DeviceFault
        ]
    );
    assert!(dev.commands.iter().all(|c| *c == 0.0), "{:?}", dev.commands);
    assert!(lp.is_halted());
    assert_eq!(lp.active_trial(), None);
    assert!(matches!(
        lp.device_fault(),
        Some(ExoError::DeviceFault {
            consecutive_timeouts: 3,
            last_error: DeviceError::Timeout { op: DeviceOp::Read, .. },
        })
    ));

    // Halted: the device is healthy again but nothing is actuated.
    for _ in 0..50 {
        let s = lp.run_tick(&mut dev);
        assert_eq!(s.status, TickStatus::Halted);
        assert_eq!(s.commanded_torque, 0.0);
    }
    assert_eq!(lp.stats().device_faults, 1);
}

#[test]
fn success_between_timeouts_resets_the_count() {
    let mut dev = Flaky::new();
    let mut lp = assisting_loop(&mut dev);
    for _ in 0..4 {
        dev.fail_reads = 2;
        for _ in 0..3 {
            let s = lp.run_tick(&mut dev);
            assert_ne!(s.status, TickStatus::DeviceFault);
        }
    }
    assert!(!lp.is_halted());
    assert_eq!(lp.stats().timeouts, 8);
}

#[test]
fn reset_after_fault_requires_new_gait_lock() {
    let mut dev = Flaky::new();
    let mut lp = assisting_loop(&mut dev);
    dev.fail_reads = 3;
    for _ in 0..3 {
        lp.run_tick(&mut dev);
    }
    assert!(lp.is_halted());
    dev.reconnect().unwrap();
    lp.reset_fault();
    assert!(!lp.is_halted());
    let s = lp.run_tick(&mut dev);
    assert_eq!(s.status, TickStatus::AwaitingPhase);
    assert_eq!(s.commanded_torque, 0.0);
    assert!(lp.device_fault().is_none());
}

/// Reads succeed just inside the timeout; every write uses it up and fails.
struct SlowLink {
    inner: SimulatedDevice,
    granted: Duration,
}

impl Device for SlowLink {
    fn read_sample(&mut self, timeout: Duration) -> Result<InertialSample, DeviceError> {
        self.granted += timeout;
        std::thread::sleep(timeout.mul_f64(0.95));
        self.inner.read_sample(timeout)
    }

    fn write_command(
        &mut self,
        _torque_nm: f64,
        timeout: Duration,
    ) -> Result<CommandAck, DeviceError> {
        self.granted += timeout;
        std::thread::sleep(timeout);
        Err(DeviceError::Timeout {
            op: DeviceOp::Write,
            after: timeout,
        })
    }

    fn zero(&mut self) -> Result<Baseline, DeviceError> {
        self.inner.zero()
    }
}

#[test]
fn failed_write_tick_fits_the_period() {
    let cfg = SessionConfig::default();
    cfg.validate().unwrap();
    let mut lp = ControlLoop::new(&cfg.control, cfg.gait.clone());
    let period = lp.timebase().period();
    let mut dev = SlowLink {
        inner: SimulatedDevice::new(SimulationConfig::default(), lp.timebase().period_sec()),
        granted: Duration::ZERO,
    };

    for _ in 0..3 {
        dev.granted = Duration::ZERO;
        let started = std::time::Instant::now();
        let s = lp.run_tick(&mut dev);
        let elapsed = started.elapsed();
        assert!(s.status.is_fault(), "{s:?}");
        assert_eq!(s.commanded_torque, 0.0);
        assert!(dev.granted <= period, "granted {:?} of {period:?}", dev.granted);
        assert!(elapsed <= period, "tick took {elapsed:?} of {period:?}");
    }
    assert!(lp.is_halted());
}

//! Runs the control loop for one comparison window.
//!
//! A window opens when the trial profile is handed to the loop and is
//! measured from the heel strike that engages it: `Strides(n)` ends on the
//! n-th heel strike after that one, `Seconds(s)` after `s` seconds of
//! engaged ticks. Samples from the lead-in before engagement belong to the
//! window too, so every tick is accounted for.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::GaitConfig;
use crate::control::{ActiveProfile, ControlExit, ControlLoop, ControlTask};
use crate::core::profile::ProfileParameters;
use crate::core::sample::{ControlSample, TickStatus};
use crate::core::timebase::Timebase;
use crate::device::{Device, DeviceError};
use crate::error::ExoError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WindowSpec", into = "WindowSpec")]
pub enum ComparisonWindow {
    Strides(u32),
    Seconds(f64),
}

impl Default for ComparisonWindow {
    fn default() -> Self {
        Self::Strides(3)
    }
}

/// TOML shape: `{ strides = 3 }` or `{ seconds = 8.0 }`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct WindowSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    strides: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seconds: Option<f64>,
}

impl TryFrom<WindowSpec> for ComparisonWindow {
    type Error = String;

    fn try_from(spec: WindowSpec) -> Result<Self, Self::Error> {
        match (spec.strides, spec.seconds) {
            (Some(n), None) => Ok(Self::Strides(n)),
            (None, Some(s)) => Ok(Self::Seconds(s)),
            (None, None) => Ok(Self::default()),
            (Some(_), Some(_)) => Err("window takes either strides or seconds, not both".into()),
        }
    }
}

impl From<ComparisonWindow> for WindowSpec {
    fn from(w: ComparisonWindow) -> Self {
        match w {
            ComparisonWindow::Strides(n) => Self {
                strides: Some(n),
                seconds: None,
            },
            ComparisonWindow::Seconds(s) => Self {
                strides: None,
                seconds: Some(s),
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct WindowReport {
    pub samples: Vec<ControlSample>,
    /// Set when the window ended early; the trial must be aborted.
    pub fault: Option<ExoError>,
}

impl WindowReport {
    pub fn is_complete(&self) -> bool {
        self.fault.is_none()
    }

    pub fn heel_strikes(&self) -> usize {
        self.samples.iter().filter(|s| s.heel_strike).count()
    }
}

/// Trial-side view of the control loop.
pub trait TrialRunner {
    fn run_window(
        &mut self,
        trial_index: u32,
        params: Arc<ProfileParameters>,
        window: ComparisonWindow,
    ) -> Result<WindowReport, ExoError>;

    /// Walk unassisted until `strides` heel strikes were seen.
    fn warmup(&mut self, strides: u32) -> Result<WindowReport, ExoError>;

    /// Reconnect the device and clear the loop's faulted state.
    fn recover(&mut self) -> Result<(), ExoError>;

    /// Samples produced while no window was open (e.g. awaiting a response).
    fn drain_idle(&mut self) -> Vec<ControlSample> {
        Vec::new()
    }
}

/// Window bookkeeping shared by both runners.
#[derive(Debug)]
struct WindowTracker {
    trial_index: Option<u32>,
    window: ComparisonWindow,
    timebase: Timebase,
    max_ticks: u64,
    ticks: u64,
    engaged_ticks: u64,
    strikes_after_engage: u32,
    engaged: bool,
}

impl WindowTracker {
    fn new(trial_index: Option<u32>, window: ComparisonWindow, timebase: Timebase, gait: &GaitConfig) -> Self {
        // Generous cap so a lost gait lock cannot hold a window open forever.
        let max_s = match window {
            ComparisonWindow::Strides(n) => (n as f64 + 2.0) * gait.max_stride_s,
            ComparisonWindow::Seconds(s) => s + 2.0 * gait.max_stride_s,
        };
        Self {
            trial_index,
            window,
            timebase,
            max_ticks: timebase.sec_to_tick(max_s).max(1),
            ticks: 0,
            engaged_ticks: 0,
            strikes_after_engage: 0,
            engaged: trial_index.is_none(),
        }
    }

    /// Feed one sample; returns true when the window is complete.
    fn observe(&mut self, s: &ControlSample) -> bool {
        self.ticks += 1;
        if !self.engaged {
            if s.trial_index.is_some() && s.trial_index == self.trial_index {
                self.engaged = true;
                self.engaged_ticks = 1;
            }
            return false;
        }
        self.engaged_ticks += 1;
        if s.heel_strike {
            self.strikes_after_engage += 1;
        }
        match self.window {
            ComparisonWindow::Strides(n) => self.strikes_after_engage >= n,
            ComparisonWindow::Seconds(sec) => {
                self.engaged_ticks >= self.timebase.sec_to_tick(sec).max(1)
            }
        }
    }

    fn timed_out(&self) -> bool {
        self.ticks >= self.max_ticks
    }

    fn incomplete(&self) -> ExoError {
        ExoError::WindowIncomplete(match self.window {
            ComparisonWindow::Strides(n) => format!(
                "{} of {n} strides after {} ticks (engaged: {})",
                self.strikes_after_engage, self.ticks, self.engaged
            ),
            ComparisonWindow::Seconds(s) => format!(
                "{:.2} of {s:.2} s after {} ticks (engaged: {})",
                self.timebase.tick_to_sec(self.engaged_ticks),
                self.ticks,
                self.engaged
            ),
        })
    }
}

/// Runs the loop synchronously on the caller's thread with no pacing.
/// Suited to the simulated device, whose clock advances per read.
pub struct InlineRunner<D: Device> {
    device: D,
    control_loop: ControlLoop,
    gait: GaitConfig,
}

impl<D: Device> InlineRunner<D> {
    pub fn new(device: D, control_loop: ControlLoop, gait: GaitConfig) -> Self {
        Self {
            device,
            control_loop,
            gait,
        }
    }

    pub fn calibrate(&mut self) -> Result<(), ExoError> {
        self.control_loop.calibrate(&mut self.device)?;
        Ok(())
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn control_loop(&self) -> &ControlLoop {
        &self.control_loop
    }

    /// Command zero torque and hand the device back.
    pub fn into_device(mut self) -> D {
        self.control_loop.set_profile(None);
        let _ = self
            .device
            .write_command(0.0, self.control_loop.io_timeout());
        self.device
    }

    fn run(&mut self, trial_index: Option<u32>, window: ComparisonWindow) -> WindowReport {
        let timebase = self.control_loop.timebase();
        let mut tracker = WindowTracker::new(trial_index, window, timebase, &self.gait);
        let mut report = WindowReport::default();
        loop {
            let s = self.control_loop.run_tick(&mut self.device);
            let status = s.status;
            let done = tracker.observe(&s);
            report.samples.push(s);
            if status == TickStatus::DeviceFault {
                report.fault = self.control_loop.device_fault();
                break;
            }
            if done {
                break;
            }
            if tracker.timed_out() {
                report.fault = Some(tracker.incomplete());
                break;
            }
        }
        self.control_loop.set_profile(None);
        self.control_loop.guard_mut().flush();
        report
    }
}

impl<D: Device> TrialRunner for InlineRunner<D> {
    fn run_window(
        &mut self,
        trial_index: u32,
        params: Arc<ProfileParameters>,
        window: ComparisonWindow,
    ) -> Result<WindowReport, ExoError> {
        if self.control_loop.is_halted() {
            return Err(self
                .control_loop
                .device_fault()
                .unwrap_or(ExoError::Device(DeviceError::Disconnected)));
        }
        self.control_loop
            .set_profile(Some(ActiveProfile::new(trial_index, params)));
        Ok(self.run(Some(trial_index), window))
    }

    fn warmup(&mut self, strides: u32) -> Result<WindowReport, ExoError> {
        self.control_loop.set_profile(None);
        Ok(self.run(None, ComparisonWindow::Strides(strides)))
    }

    fn recover(&mut self) -> Result<(), ExoError> {
        self.device.reconnect()?;
        self.control_loop.reset_fault();
        Ok(())
    }
}

/// Trial-side half of a [`ControlTask`]: the loop keeps ticking between
/// windows, and those idle samples are kept for [`TrialRunner::drain_idle`].
pub struct ThreadedRunner<D: Device + 'static> {
    task: ControlTask<D>,
    timebase: Timebase,
    gait: GaitConfig,
    sample_timeout: Duration,
}

impl<D: Device + 'static> ThreadedRunner<D> {
    pub fn new(task: ControlTask<D>, timebase: Timebase, gait: GaitConfig) -> Self {
        // A healthy loop emits a sample every period, even while faulted.
        let sample_timeout = (timebase.period() * 50).max(Duration::from_millis(500));
        Self {
            task,
            timebase,
            gait,
            sample_timeout,
        }
    }

    pub fn task(&self) -> &ControlTask<D> {
        &self.task
    }

    pub fn stop(self) -> Result<ControlExit<D>, ExoError> {
        self.task.stop()
    }

    fn run(&mut self, trial_index: Option<u32>, window: ComparisonWindow) -> Result<WindowReport, ExoError> {
        let mut tracker = WindowTracker::new(trial_index, window, self.timebase, &self.gait);
        let mut report = WindowReport::default();
        loop {
            if self.task.is_stopping() {
                report.fault = Some(ExoError::ControlTask("stopped".into()));
                break;
            }
            // Samples already collected are kept; the trial is aborted instead.
            let s = match self.task.samples().recv_timeout(self.sample_timeout) {
                Ok(s) => s,
                Err(RecvTimeoutError::Timeout) => {
                    report.fault = Some(ExoError::ControlTask(format!(
                        "no control sample for {:?}",
                        self.sample_timeout
                    )));
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    report.fault = Some(ExoError::ControlTask("control thread exited".into()));
                    break;
                }
            };
            let status = s.status;
            let done = tracker.observe(&s);
            report.samples.push(s);
            if status == TickStatus::DeviceFault {
                report.fault = Some(self.task.faults().try_recv().unwrap_or(
                    ExoError::DeviceFault {
                        consecutive_timeouts: 0,
                        last_error: DeviceError::Disconnected,
                    },
                ));
                break;
            }
            if status == TickStatus::Halted && trial_index.is_some() {
                report.fault = Some(ExoError::Device(DeviceError::Disconnected));
                break;
            }
            if done {
                break;
            }
            if tracker.timed_out() {
                report.fault = Some(tracker.incomplete());
                break;
            }
        }
        self.task.publisher().publish(None);
        Ok(report)
    }
}

impl<D: Device + 'static> TrialRunner for ThreadedRunner<D> {
    fn run_window(
        &mut self,
        trial_index: u32,
        params: Arc<ProfileParameters>,
        window: ComparisonWindow,
    ) -> Result<WindowReport, ExoError> {
        // Samples queued before the handoff are lead-in for this window.
        let mut report = WindowReport {
            samples: self.drain_idle(),
            fault: None,
        };
        if let Some(stats) = self.task.guard_meter().take_snapshot() {
            warn!(
                target: "session",
                "torque guard engaged before trial {trial_index}: {} clamped (max {:.2} Nm), {} non-finite",
                stats.num_clamped,
                stats.max_requested,
                stats.num_non_finite
            );
        }
        if !self
            .task
            .publisher()
            .publish(Some(ActiveProfile::new(trial_index, params)))
        {
            report.fault = Some(ExoError::ControlTask("control thread exited".into()));
            return Ok(report);
        }
        let window_report = self.run(Some(trial_index), window)?;
        report.samples.extend(window_report.samples);
        report.fault = window_report.fault;
        Ok(report)
    }

    fn warmup(&mut self, strides: u32) -> Result<WindowReport, ExoError> {
        info!(target: "session", "warm-up: {strides} strides");
        self.task.publisher().publish(None);
        self.run(None, ComparisonWindow::Strides(strides))
    }

    fn recover(&mut self) -> Result<(), ExoError> {
        warn!(target: "session", "reconnecting device");
        // Faults already reported must not leak into the next window.
        for stale in self.task.faults().try_iter() {
            debug!(target: "session", "discarding reported fault: {stale}");
        }
        self.task.reconnect()
    }

    fn drain_idle(&mut self) -> Vec<ControlSample> {
        self.task.samples().try_iter().collect()
    }
}

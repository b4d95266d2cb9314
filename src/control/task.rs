//! Fixed-period control thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use tracing::{info, warn};

use crate::control::control_loop::{ControlLoop, LoopStats};
use crate::control::handoff::{ProfilePublisher, ProfileSubscriber, profile_channel};
use crate::core::sample::{ControlSample, TickStatus};
use crate::device::{CommandGuardMeter, Device, DeviceError};
use crate::error::ExoError;

pub enum ControlCommand {
    Stop,
    /// Reconnect the device and clear the faulted state.
    Reconnect(Sender<Result<(), DeviceError>>),
}

/// Counters readable from any thread while the task runs.
#[derive(Debug, Default)]
pub struct TaskMeter {
    ticks: AtomicU64,
    deadline_misses: AtomicU64,
}

impl TaskMeter {
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn deadline_misses(&self) -> u64 {
        self.deadline_misses.load(Ordering::Relaxed)
    }
}

/// What the control thread hands back when it exits.
pub struct ControlExit<D> {
    pub device: D,
    pub stats: LoopStats,
}

/// Handle to the control thread. Dropping it stops the thread.
pub struct ControlTask<D: Device + 'static> {
    handle: Option<JoinHandle<ControlExit<D>>>,
    cmd_tx: Sender<ControlCommand>,
    publisher: ProfilePublisher,
    sample_rx: Receiver<ControlSample>,
    fault_rx: Receiver<ExoError>,
    stop: Arc<AtomicBool>,
    meter: Arc<TaskMeter>,
    guard_meter: Arc<CommandGuardMeter>,
}

impl<D: Device + 'static> ControlTask<D> {
    pub fn spawn(device: D, control_loop: ControlLoop) -> Result<Self, ExoError> {
        Self::spawn_with_stop(device, control_loop, Arc::new(AtomicBool::new(false)))
    }

    /// Spawn with an externally owned stop flag (e.g. set from Ctrl-C).
    pub fn spawn_with_stop(
        device: D,
        mut control_loop: ControlLoop,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, ExoError> {
        let guard_meter = control_loop.guard_mut().shared_meter();
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (sample_tx, sample_rx) = crossbeam_channel::unbounded();
        let (fault_tx, fault_rx) = crossbeam_channel::unbounded();
        let (publisher, subscriber) = profile_channel();
        let meter = Arc::new(TaskMeter::default());

        let stop_for_thread = stop.clone();
        let meter_for_thread = meter.clone();
        let handle = thread::Builder::new()
            .name("control".into())
            .spawn(move || {
                control_thread(
                    device,
                    control_loop,
                    subscriber,
                    cmd_rx,
                    sample_tx,
                    fault_tx,
                    stop_for_thread,
                    meter_for_thread,
                )
            })
            .map_err(|e| ExoError::ControlTask(format!("spawn control thread: {e}")))?;

        Ok(Self {
            handle: Some(handle),
            cmd_tx,
            publisher,
            sample_rx,
            fault_rx,
            stop,
            meter,
            guard_meter,
        })
    }

    pub fn publisher(&self) -> &ProfilePublisher {
        &self.publisher
    }

    pub fn samples(&self) -> &Receiver<ControlSample> {
        &self.sample_rx
    }

    /// Device faults, sent just before the sample that reports them.
    pub fn faults(&self) -> &Receiver<ExoError> {
        &self.fault_rx
    }

    pub fn meter(&self) -> &TaskMeter {
        &self.meter
    }

    /// Torque guard interventions, published each time a profile is withdrawn.
    pub fn guard_meter(&self) -> &CommandGuardMeter {
        &self.guard_meter
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn reconnect(&self) -> Result<(), ExoError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.cmd_tx
            .send(ControlCommand::Reconnect(reply_tx))
            .map_err(|_| ExoError::ControlTask("control thread gone".into()))?;
        let reply = reply_rx
            .recv()
            .map_err(|_| ExoError::ControlTask("control thread exited during reconnect".into()))?;
        reply.map_err(ExoError::from)
    }

    /// Command zero torque, stop the thread and take the device back.
    pub fn stop(mut self) -> Result<ControlExit<D>, ExoError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<ControlExit<D>, ExoError> {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(ControlCommand::Stop);
        let handle = self
            .handle
            .take()
            .ok_or_else(|| ExoError::ControlTask("already stopped".into()))?;
        handle
            .join()
            .map_err(|_| ExoError::ControlTask("control thread panicked".into()))
    }
}

impl<D: Device + 'static> Drop for ControlTask<D> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.shutdown();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn control_thread<D: Device>(
    mut device: D,
    mut control_loop: ControlLoop,
    mut subscriber: ProfileSubscriber,
    cmd_rx: Receiver<ControlCommand>,
    sample_tx: Sender<ControlSample>,
    fault_tx: Sender<ExoError>,
    stop: Arc<AtomicBool>,
    meter: Arc<TaskMeter>,
) -> ControlExit<D> {
    let period = control_loop.timebase().period();
    let io_timeout = control_loop.io_timeout();
    info!(target: "control", "control thread started, period {period:?}");

    let mut next_deadline = Instant::now();
    'run: loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        for cmd in cmd_rx.try_iter() {
            match cmd {
                ControlCommand::Stop => break 'run,
                ControlCommand::Reconnect(reply) => {
                    let _ = device.write_command(0.0, io_timeout);
                    let result = device.reconnect();
                    if result.is_ok() {
                        control_loop.reset_fault();
                    } else {
                        warn!(target: "control", "reconnect failed: {result:?}");
                    }
                    let _ = reply.send(result);
                    next_deadline = Instant::now();
                }
            }
        }
        if let Some(update) = subscriber.take_latest() {
            let withdrawn = update.is_none();
            control_loop.set_profile(update);
            if withdrawn {
                control_loop.guard_mut().flush();
            }
        }

        next_deadline += period;
        let sample = control_loop.run_tick(&mut device);
        meter.ticks.fetch_add(1, Ordering::Relaxed);
        if sample.status == TickStatus::DeviceFault {
            if let Some(fault) = control_loop.device_fault() {
                let _ = fault_tx.send(fault);
            }
        }
        if sample_tx.send(sample).is_err() {
            break;
        }

        let now = Instant::now();
        if now < next_deadline {
            thread::sleep(next_deadline - now);
        } else {
            meter.deadline_misses.fetch_add(1, Ordering::Relaxed);
            next_deadline = now;
        }
    }

    control_loop.set_profile(None);
    control_loop.guard_mut().flush();
    if let Err(err) = device.write_command(0.0, io_timeout) {
        warn!(target: "control", "zero-torque command on stop failed: {err}");
    }
    let stats = control_loop.stats();
    info!(
        target: "control",
        "control thread stopped after {} ticks ({} deadline misses)",
        stats.ticks,
        meter.deadline_misses()
    );
    ControlExit { device, stats }
}

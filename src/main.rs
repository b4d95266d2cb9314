// Entry point: runs one staircase session against the simulated boot.
mod cli;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use clap::Parser;
use crossbeam_channel::Receiver;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use exo_perception::config::SessionConfig;
use exo_perception::control::{ControlLoop, ControlTask};
use exo_perception::device::SimulatedDevice;
use exo_perception::error::ExoError;
use exo_perception::persist::{CsvSink, SinkWriter};
use exo_perception::trial::{
    InlineRunner, InterruptiblePrompt, Response, ResponseSource, ScriptedResponses, SessionOutcome,
    SessionReport, ThreadedRunner, TrialRunner, TrialSequencer,
};

use crate::cli::Args;

/// Turns Ctrl-C into a cancelled response for sessions that block on input.
struct Interruptible<R> {
    inner: R,
    stop: Arc<AtomicBool>,
}

impl<R: ResponseSource> ResponseSource for Interruptible<R> {
    fn next_response(
        &mut self,
        trial_index: u32,
        tested_value: f64,
    ) -> Result<Option<Response>, ExoError> {
        if self.stop.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let response = self.inner.next_response(trial_index, tested_value)?;
        if self.stop.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(response)
    }
}

fn apply_overrides(cfg: &mut SessionConfig, args: &Args) {
    if let Some(p) = &args.participant {
        cfg.session.participant_id = p.clone();
    }
    if let Some(c) = args.condition {
        cfg.staircase.condition = c.into();
    }
    if let Some(o) = &args.output {
        cfg.session.output_dir = o.clone();
    }
    if let Some(seed) = args.seed {
        cfg.simulation.seed = seed;
    }
    if let Some(stride) = args.stride_s {
        cfg.simulation.stride_s = stride;
    }
}

fn session_dir(cfg: &SessionConfig) -> PathBuf {
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    PathBuf::from(&cfg.session.output_dir).join(format!(
        "{}_{}_{stamp}",
        cfg.session.participant_id,
        cfg.staircase.condition.name()
    ))
}

fn run_session<R: TrialRunner>(
    cfg: &SessionConfig,
    runner: R,
    responses: Box<dyn ResponseSource>,
) -> Result<(SessionReport, R), ExoError> {
    let sink = SinkWriter::spawn(CsvSink::create(session_dir(cfg))?)?;
    let mut sequencer = TrialSequencer::new(cfg, runner, responses, sink)?;
    let report = sequencer.run()?;
    let (runner, _, _) = sequencer.into_parts();
    Ok((report, runner))
}

fn run(args: &Args, stop: Arc<AtomicBool>, cancel: Receiver<()>) -> Result<SessionReport, ExoError> {
    let mut cfg = SessionConfig::load_or_default(&args.config);
    apply_overrides(&mut cfg, args);
    cfg.validate()?;

    let responses: Box<dyn ResponseSource> = match &args.responses {
        Some(list) => Box::new(Interruptible {
            inner: ScriptedResponses::new(Response::parse_list(list)?),
            stop: stop.clone(),
        }),
        None => Box::new(Interruptible {
            inner: InterruptiblePrompt::stdio(cancel)?,
            stop: stop.clone(),
        }),
    };

    let mut control_loop = ControlLoop::new(&cfg.control, cfg.gait.clone());
    let mut device = SimulatedDevice::new(
        cfg.simulation.clone(),
        control_loop.timebase().period_sec(),
    );
    let baseline = control_loop.calibrate(&mut device)?;
    info!(
        "device zeroed: gyro bias {:.3}, current offset {:.3} A",
        baseline.gyro_z_bias, baseline.current_offset_a
    );

    if args.inline {
        let runner = InlineRunner::new(device, control_loop, cfg.gait.clone());
        let (report, runner) = run_session(&cfg, runner, responses)?;
        let device = runner.into_device();
        info!("simulated {} strides", device.strides());
        Ok(report)
    } else {
        let timebase = control_loop.timebase();
        let task = ControlTask::spawn_with_stop(device, control_loop, stop)?;
        let runner = ThreadedRunner::new(task, timebase, cfg.gait.clone());
        let (report, runner) = run_session(&cfg, runner, responses)?;
        let exit = runner.stop()?;
        info!(
            "control loop: {} ticks, {} device faults, {} heel strikes",
            exit.stats.ticks, exit.stats.device_faults, exit.stats.heel_strikes
        );
        Ok(report)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_for_ctrlc = stop_flag.clone();
    // Wakes a pending response prompt.
    let (cancel_tx, cancel_rx) = crossbeam_channel::bounded(1);
    if let Err(err) = ctrlc::set_handler(move || {
        stop_flag_for_ctrlc.store(true, Ordering::SeqCst);
        let _ = cancel_tx.try_send(());
    }) {
        warn!("Ctrl-C handler not installed: {err}");
    }

    match run(&args, stop_flag, cancel_rx) {
        Ok(report) => {
            match report.outcome {
                SessionOutcome::Converged { threshold } => {
                    info!("threshold {threshold:.3} after {} trials", report.trials_run)
                }
                SessionOutcome::Exhausted => warn!(
                    "no convergence after {} trials; last value {:.3}",
                    report.trials_run, report.final_value
                ),
                SessionOutcome::Cancelled => warn!("session cancelled"),
            }
            if report.outcome == SessionOutcome::Cancelled {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            error!("session failed: {err}");
            ExitCode::FAILURE
        }
    }
}

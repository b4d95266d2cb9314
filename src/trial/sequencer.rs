//! Drives one session: warm-up, then one comparison window, response and
//! staircase step per trial until convergence or the trial cap.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::core::profile::{Condition, ProfileParameters};
use crate::error::ExoError;
use crate::persist::SessionSink;
use crate::trial::response::{Response, ResponseSource};
use crate::trial::runner::{ComparisonWindow, TrialRunner, WindowReport};
use crate::trial::staircase::StaircaseController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrialOutcome {
    Completed,
    Aborted,
}

/// One row per trial, completed or aborted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial_index: u32,
    pub condition_name: String,
    pub tested_parameter_value: f64,
    pub response: Option<Response>,
    /// Wall clock, seconds since the UNIX epoch.
    pub timestamp_s: f64,
    pub outcome: TrialOutcome,
    pub step_size: f64,
    pub reversal: bool,
    /// Staircase value after this trial.
    pub next_value: f64,
    pub samples: usize,
    pub abort_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SessionOutcome {
    Converged {
        threshold: f64,
    },
    /// Trial cap reached first; partial results are kept.
    #[default]
    Exhausted,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionReport {
    pub participant_id: String,
    pub condition_name: String,
    pub outcome: SessionOutcome,
    pub trials_run: u32,
    pub trials_aborted: u32,
    pub final_value: f64,
    pub final_step_size: f64,
    pub reversal_count: u32,
    pub reversal_values: Vec<f64>,
    pub threshold_estimate: Option<f64>,
    pub started_at_s: f64,
    pub finished_at_s: f64,
}

fn wall_clock_s() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub struct TrialSequencer<R, S, K> {
    runner: R,
    responses: S,
    sink: K,
    staircase: StaircaseController,
    base: ProfileParameters,
    condition: Condition,
    window: ComparisonWindow,
    warmup_strides: u32,
    max_trials: u32,
    participant_id: String,
    records: Vec<TrialRecord>,
}

impl<R: TrialRunner, S: ResponseSource, K: SessionSink> TrialSequencer<R, S, K> {
    /// Fails before anything runs if the configuration, including every
    /// admissible staircase value, cannot produce a valid profile.
    pub fn new(cfg: &SessionConfig, runner: R, responses: S, sink: K) -> Result<Self, ExoError> {
        cfg.validate()?;
        let base = cfg.base_profile()?;
        let condition = cfg.staircase.condition;
        let staircase = StaircaseController::new(cfg.staircase.clone(), cfg.initial_value())?;
        Ok(Self {
            runner,
            responses,
            sink,
            staircase,
            base,
            condition,
            window: cfg.session.window,
            warmup_strides: cfg.session.warmup_strides,
            max_trials: cfg.staircase.max_trials,
            participant_id: cfg.session.participant_id.clone(),
            records: Vec::new(),
        })
    }

    pub fn staircase(&self) -> &StaircaseController {
        &self.staircase
    }

    pub fn records(&self) -> &[TrialRecord] {
        &self.records
    }

    pub fn runner_mut(&mut self) -> &mut R {
        &mut self.runner
    }

    pub fn into_parts(self) -> (R, S, K) {
        (self.runner, self.responses, self.sink)
    }

    pub fn run(&mut self) -> Result<SessionReport, ExoError> {
        let started_at_s = wall_clock_s();
        info!(
            target: "session",
            "participant {}: {} staircase from {:.2} (range [{}, {}])",
            self.participant_id,
            self.condition,
            self.staircase.current_value(),
            self.staircase.config().parameter_range.min,
            self.staircase.config().parameter_range.max
        );

        if self.warmup_strides > 0 {
            let report = self.runner.warmup(self.warmup_strides)?;
            self.sink.append_samples(None, &report.samples)?;
            if let Some(fault) = report.fault {
                warn!(target: "session", "warm-up incomplete: {fault}");
                if matches!(fault, ExoError::ControlTask(_)) {
                    return self.finish(SessionOutcome::Cancelled, started_at_s);
                }
                if Self::needs_recovery(&fault) {
                    self.runner.recover()?;
                }
            }
        }

        let mut trial_index: u32 = 0;
        let outcome = loop {
            if let Some(threshold) = self.staircase.threshold() {
                break SessionOutcome::Converged { threshold };
            }
            if trial_index >= self.max_trials {
                info!(target: "session", "trial cap {} reached without convergence", self.max_trials);
                break SessionOutcome::Exhausted;
            }

            let value = self.staircase.begin_presentation()?;
            let params = match self.base.with_condition(self.condition, value) {
                Ok(p) => Arc::new(p),
                Err(err) => {
                    self.staircase.cancel_presentation()?;
                    return Err(err);
                }
            };
            info!(target: "session", "trial {trial_index}: {} = {value:.3}", self.condition);

            let window = match self.runner.run_window(trial_index, params, self.window) {
                Ok(w) => w,
                Err(err) => {
                    self.staircase.cancel_presentation()?;
                    return Err(err);
                }
            };
            self.sink.append_samples(Some(trial_index), &window.samples)?;

            if let Some(fault) = window.fault {
                self.abort_trial(trial_index, value, window.samples.len(), &fault)?;
                trial_index += 1;
                if matches!(fault, ExoError::ControlTask(_)) {
                    break SessionOutcome::Cancelled;
                }
                if Self::needs_recovery(&fault) {
                    self.runner.recover()?;
                }
                continue;
            }

            let response = self.responses.next_response(trial_index, value);
            let idle = self.runner.drain_idle();
            if !idle.is_empty() {
                self.sink.append_samples(None, &idle)?;
            }
            let Some(response) = response? else {
                self.staircase.cancel_presentation()?;
                info!(target: "session", "session cancelled at trial {trial_index}");
                break SessionOutcome::Cancelled;
            };

            self.complete_trial(trial_index, response, &window)?;
            trial_index += 1;
        };

        self.finish(outcome, started_at_s)
    }

    fn needs_recovery(fault: &ExoError) -> bool {
        matches!(fault, ExoError::DeviceFault { .. } | ExoError::Device(_))
    }

    fn complete_trial(
        &mut self,
        trial_index: u32,
        response: Response,
        window: &WindowReport,
    ) -> Result<(), ExoError> {
        let step = self.staircase.respond(response)?;
        info!(
            target: "session",
            "trial {trial_index}: {response} at {:.3} -> {:.3}{}",
            step.value_before,
            step.value_after,
            if step.reversal { " (reversal)" } else { "" }
        );
        let record = TrialRecord {
            trial_index,
            condition_name: self.condition.name().to_string(),
            tested_parameter_value: step.value_before,
            response: Some(response),
            timestamp_s: wall_clock_s(),
            outcome: TrialOutcome::Completed,
            step_size: step.step_size,
            reversal: step.reversal,
            next_value: step.value_after,
            samples: window.samples.len(),
            abort_reason: None,
        };
        self.sink.append_trial(&record)?;
        self.records.push(record);
        Ok(())
    }

    fn abort_trial(
        &mut self,
        trial_index: u32,
        value: f64,
        samples: usize,
        fault: &ExoError,
    ) -> Result<(), ExoError> {
        warn!(target: "session", "trial {trial_index} aborted: {fault}");
        self.staircase.cancel_presentation()?;
        let record = TrialRecord {
            trial_index,
            condition_name: self.condition.name().to_string(),
            tested_parameter_value: value,
            response: None,
            timestamp_s: wall_clock_s(),
            outcome: TrialOutcome::Aborted,
            step_size: self.staircase.step_size(),
            reversal: false,
            next_value: self.staircase.current_value(),
            samples,
            abort_reason: Some(fault.to_string()),
        };
        self.sink.append_trial(&record)?;
        self.records.push(record);
        Ok(())
    }

    fn finish(
        &mut self,
        outcome: SessionOutcome,
        started_at_s: f64,
    ) -> Result<SessionReport, ExoError> {
        let report = SessionReport {
            participant_id: self.participant_id.clone(),
            condition_name: self.condition.name().to_string(),
            outcome,
            trials_run: self.records.len() as u32,
            trials_aborted: self
                .records
                .iter()
                .filter(|r| r.outcome == TrialOutcome::Aborted)
                .count() as u32,
            final_value: self.staircase.current_value(),
            final_step_size: self.staircase.step_size(),
            reversal_count: self.staircase.reversal_count(),
            reversal_values: self.staircase.reversal_values().to_vec(),
            threshold_estimate: self.staircase.threshold_estimate(),
            started_at_s,
            finished_at_s: wall_clock_s(),
        };
        info!(
            target: "session",
            "session finished: {:?} after {} trials ({} aborted)",
            report.outcome,
            report.trials_run,
            report.trials_aborted
        );
        self.sink.finish(&report)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterRange;
    use crate::core::sample::{ControlSample, TickStatus};
    use crate::device::DeviceError;
    use crate::persist::MemorySink;
    use crate::trial::response::ScriptedResponses;
    use crate::trial::staircase::Direction;
    use std::collections::VecDeque;

    /// Runner that fabricates short windows and optional faults.
    #[derive(Default)]
    struct FakeRunner {
        faults: VecDeque<Option<ExoError>>,
        presented: Vec<(u32, f64)>,
        recoveries: u32,
    }

    fn sample(trial: Option<u32>) -> ControlSample {
        ControlSample {
            tick: 0,
            timestamp_s: 0.0,
            trial_index: trial,
            percent_gait: 0.0,
            commanded_torque: 0.0,
            measured_current: None,
            gyro_z: None,
            stride_estimate_s: None,
            heel_strike: true,
            status: TickStatus::Active,
        }
    }

    impl TrialRunner for FakeRunner {
        fn run_window(
            &mut self,
            trial_index: u32,
            params: Arc<ProfileParameters>,
            _window: ComparisonWindow,
        ) -> Result<WindowReport, ExoError> {
            self.presented.push((trial_index, params.onset_pct()));
            Ok(WindowReport {
                samples: vec![sample(Some(trial_index)); 3],
                fault: self.faults.pop_front().flatten(),
            })
        }

        fn warmup(&mut self, _strides: u32) -> Result<WindowReport, ExoError> {
            Ok(WindowReport {
                samples: vec![sample(None); 2],
                fault: None,
            })
        }

        fn recover(&mut self) -> Result<(), ExoError> {
            self.recoveries += 1;
            Ok(())
        }
    }

    fn config() -> SessionConfig {
        let mut cfg = SessionConfig::default();
        cfg.staircase.parameter_range = ParameterRange::new(5.0, 35.0);
        cfg.staircase.initial_value = Some(20.0);
        cfg.staircase.initial_step_size = 4.0;
        cfg.staircase.reversal_target = 2;
        cfg.staircase.max_trials = 10;
        cfg.staircase.initial_direction = Direction::Down;
        cfg
    }

    fn device_fault() -> ExoError {
        ExoError::DeviceFault {
            consecutive_timeouts: 3,
            last_error: DeviceError::Disconnected,
        }
    }

    #[test]
    fn aborted_trial_is_recorded_and_retried() {
        let runner = FakeRunner {
            faults: VecDeque::from([None, Some(device_fault())]),
            ..FakeRunner::default()
        };
        let responses = ScriptedResponses::new([Response::Later, Response::Later, Response::Earlier]);
        let mut seq = TrialSequencer::new(&config(), runner, responses, MemorySink::new()).unwrap();
        let report = seq.run().unwrap();

        assert_eq!(report.outcome, SessionOutcome::Converged { threshold: 24.0 });
        assert_eq!(report.trials_run, 4);
        assert_eq!(report.trials_aborted, 1);
        let (runner, _, sink) = seq.into_parts();
        assert_eq!(runner.recoveries, 1);
        // The aborted trial re-presents the same value.
        let onsets: Vec<f64> = runner.presented.iter().map(|p| p.1).collect();
        assert_eq!(onsets, vec![20.0, 24.0, 24.0, 28.0]);
        assert_eq!(sink.trials[1].outcome, TrialOutcome::Aborted);
        assert_eq!(sink.trials[1].response, None);
        assert_eq!(sink.samples_for(1).count(), 3);
        assert_eq!(sink.sample_count(), 2 + 4 * 3);
    }

    #[test]
    fn exhausted_is_not_an_error() {
        let mut cfg = config();
        cfg.staircase.max_trials = 2;
        let responses = ScriptedResponses::new([Response::Later, Response::Later]);
        let mut seq =
            TrialSequencer::new(&cfg, FakeRunner::default(), responses, MemorySink::new()).unwrap();
        let report = seq.run().unwrap();
        assert_eq!(report.outcome, SessionOutcome::Exhausted);
        assert_eq!(report.final_value, 28.0);
        assert_eq!(report.reversal_values, vec![20.0]);
        assert_eq!(report.threshold_estimate, Some(20.0));
        let (_, _, sink) = seq.into_parts();
        assert_eq!(sink.report.unwrap(), report);
    }

    #[test]
    fn cancelled_response_ends_session() {
        let responses = ScriptedResponses::new([Response::Later]);
        let mut seq =
            TrialSequencer::new(&config(), FakeRunner::default(), responses, MemorySink::new())
                .unwrap();
        let report = seq.run().unwrap();
        assert_eq!(report.outcome, SessionOutcome::Cancelled);
        assert_eq!(report.trials_run, 1);
        assert_eq!(seq.staircase().responses(), 1);
    }

    #[test]
    fn rejects_range_that_breaks_profile() {
        let mut cfg = config();
        cfg.staircase.parameter_range = ParameterRange::new(5.0, 90.0);
        let err = TrialSequencer::new(
            &cfg,
            FakeRunner::default(),
            ScriptedResponses::default(),
            MemorySink::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ExoError::InvalidParameter(_)));
    }
}

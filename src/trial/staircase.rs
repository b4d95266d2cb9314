//! Adaptive up/down staircase over one profile dimension.
//!
//! Deterministic: the value sequence and the reversal events depend only on
//! the configuration and the ordered responses.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ParameterRange, StaircaseConfig};
use crate::error::ExoError;
use crate::trial::response::Response;

/// How a "Later" answer maps onto the adjustment direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Directionality {
    #[default]
    LaterIncreases,
    LaterDecreases,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    #[default]
    Up,
    Down,
    None,
}

impl Direction {
    fn sign(self) -> f64 {
        match self {
            Self::Up => 1.0,
            Self::Down => -1.0,
            Self::None => 0.0,
        }
    }
}

/// Treatment of a "Same" answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SameResponse {
    /// No change, no reversal.
    #[default]
    Hold,
    /// Keep moving in the previous direction.
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StaircaseState {
    Running,
    AwaitingResponse,
    Converged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StaircaseError {
    #[error("no comparison is awaiting a response")]
    NotAwaitingResponse,
    #[error("a comparison is already awaiting a response")]
    AwaitingResponse,
    #[error("staircase has already converged")]
    Converged,
}

/// Result of one response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub value_before: f64,
    pub value_after: f64,
    pub decision: Direction,
    pub reversal: bool,
    /// Step size applied to this response.
    pub step_size: f64,
    pub converged: bool,
}

#[derive(Debug, Clone)]
pub struct StaircaseController {
    cfg: StaircaseConfig,
    range: ParameterRange,
    state: StaircaseState,
    current_value: f64,
    step_size: f64,
    last_direction: Direction,
    reversal_count: u32,
    reversal_values: Vec<f64>,
    responses: u32,
    history: Vec<f64>,
}

impl StaircaseController {
    pub fn new(cfg: StaircaseConfig, initial_value: f64) -> Result<Self, ExoError> {
        let range = cfg.parameter_range;
        if !(range.min.is_finite() && range.max.is_finite() && range.min < range.max) {
            return Err(ExoError::InvalidParameter(format!(
                "parameter range [{}, {}] is empty",
                range.min, range.max
            )));
        }
        if !range.contains(initial_value) {
            return Err(ExoError::InvalidParameter(format!(
                "initial value {initial_value} outside [{}, {}]",
                range.min, range.max
            )));
        }
        if !(cfg.initial_step_size > 0.0) {
            return Err(ExoError::InvalidParameter("step size must be > 0".into()));
        }
        Ok(Self {
            range,
            state: StaircaseState::Running,
            current_value: initial_value,
            step_size: cfg.initial_step_size,
            last_direction: cfg.initial_direction,
            reversal_count: 0,
            reversal_values: Vec::new(),
            responses: 0,
            history: Vec::new(),
            cfg,
        })
    }

    pub fn state(&self) -> StaircaseState {
        self.state
    }

    pub fn is_converged(&self) -> bool {
        self.state == StaircaseState::Converged
    }

    pub fn current_value(&self) -> f64 {
        self.current_value
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    pub fn reversal_count(&self) -> u32 {
        self.reversal_count
    }

    pub fn reversal_values(&self) -> &[f64] {
        &self.reversal_values
    }

    pub fn responses(&self) -> u32 {
        self.responses
    }

    /// Value after each response, in order.
    pub fn history(&self) -> &[f64] {
        &self.history
    }

    pub fn config(&self) -> &StaircaseConfig {
        &self.cfg
    }

    /// Mean of the last K reversal values, once converged.
    pub fn threshold(&self) -> Option<f64> {
        if self.is_converged() {
            self.threshold_estimate()
        } else {
            None
        }
    }

    /// Mean of the last K reversal values so far, converged or not.
    pub fn threshold_estimate(&self) -> Option<f64> {
        let k = (self.cfg.threshold_reversals as usize).min(self.reversal_values.len());
        if k == 0 {
            return None;
        }
        let tail = &self.reversal_values[self.reversal_values.len() - k..];
        Some(tail.iter().sum::<f64>() / k as f64)
    }

    /// `Running -> AwaitingResponse`; returns the value being presented.
    pub fn begin_presentation(&mut self) -> Result<f64, StaircaseError> {
        match self.state {
            StaircaseState::Running => {
                self.state = StaircaseState::AwaitingResponse;
                Ok(self.current_value)
            }
            StaircaseState::AwaitingResponse => Err(StaircaseError::AwaitingResponse),
            StaircaseState::Converged => Err(StaircaseError::Converged),
        }
    }

    /// Withdraw a presentation that could not be completed (aborted trial).
    pub fn cancel_presentation(&mut self) -> Result<(), StaircaseError> {
        match self.state {
            StaircaseState::AwaitingResponse => {
                self.state = StaircaseState::Running;
                Ok(())
            }
            StaircaseState::Running => Err(StaircaseError::NotAwaitingResponse),
            StaircaseState::Converged => Err(StaircaseError::Converged),
        }
    }

    fn decide(&self, response: Response) -> Direction {
        let later = match self.cfg.directionality {
            Directionality::LaterIncreases => Direction::Up,
            Directionality::LaterDecreases => Direction::Down,
        };
        let earlier = match later {
            Direction::Up => Direction::Down,
            _ => Direction::Up,
        };
        match response {
            Response::Later => later,
            Response::Earlier => earlier,
            Response::Same => match self.cfg.same_response {
                SameResponse::Hold => Direction::None,
                SameResponse::Continue => self.last_direction,
            },
        }
    }

    /// `AwaitingResponse -> Running | Converged`.
    pub fn respond(&mut self, response: Response) -> Result<StepOutcome, StaircaseError> {
        match self.state {
            StaircaseState::AwaitingResponse => {}
            StaircaseState::Running => return Err(StaircaseError::NotAwaitingResponse),
            StaircaseState::Converged => return Err(StaircaseError::Converged),
        }
        self.responses += 1;
        let value_before = self.current_value;
        let step_size = self.step_size;
        let decision = self.decide(response);

        let reversal = decision != Direction::None
            && self.last_direction != Direction::None
            && decision != self.last_direction;
        if reversal {
            self.reversal_count += 1;
            self.reversal_values.push(value_before);
            debug!(
                target: "staircase",
                "reversal #{} at {value_before:.3}",
                self.reversal_count
            );
        }
        if decision != Direction::None {
            self.last_direction = decision;
        }

        self.current_value = self.range.clamp(value_before + decision.sign() * step_size);
        self.history.push(self.current_value);

        let n = self.cfg.reversals_per_reduction;
        if reversal && n > 0 && self.reversal_count % n == 0 {
            let reduced = (self.step_size * self.cfg.step_reduction_factor).max(self.cfg.min_step_size);
            if reduced != self.step_size {
                debug!(target: "staircase", "step {:.3} -> {reduced:.3}", self.step_size);
            }
            self.step_size = reduced;
        }

        let converged = self.reversal_count >= self.cfg.reversal_target;
        self.state = if converged {
            info!(
                target: "staircase",
                "converged after {} responses, threshold {:?}",
                self.responses,
                self.threshold_estimate()
            );
            StaircaseState::Converged
        } else {
            StaircaseState::Running
        };

        Ok(StepOutcome {
            value_before,
            value_after: self.current_value,
            decision,
            reversal,
            step_size,
            converged,
        })
    }
}

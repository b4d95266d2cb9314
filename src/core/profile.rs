//! Phase-indexed assistive torque profile.
//!
//! Torque is zero outside `[onset, end)`, ramps to `peak_torque` over
//! `rise_pct` and back to zero over `fall_pct`. Percentages are fractions of
//! stride length.

use std::f64::consts::PI;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ExoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProfileShape {
    Linear,
    /// Raised cosine on both ramps.
    Smooth,
    /// Cubic spline: zero slope at onset and peak, linear-ish release into end.
    #[default]
    Cubic,
}

/// The profile dimension varied by a staircase run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Condition {
    #[default]
    Onset,
    Rise,
    Fall,
}

impl Condition {
    pub fn name(self) -> &'static str {
        match self {
            Self::Onset => "onset_timing",
            Self::Rise => "rise_time",
            Self::Fall => "fall_time",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape parameters for one trial. Immutable once built; construct through
/// [`ProfileParameters::new`] so the ordering invariant always holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileParameters {
    onset_pct: f64,
    rise_pct: f64,
    fall_pct: f64,
    peak_torque: f64,
}

impl ProfileParameters {
    pub fn new(
        onset_pct: f64,
        rise_pct: f64,
        fall_pct: f64,
        peak_torque: f64,
    ) -> Result<Self, ExoError> {
        let params = Self {
            onset_pct,
            rise_pct,
            fall_pct,
            peak_torque,
        };
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<(), ExoError> {
        let fields = [self.onset_pct, self.rise_pct, self.fall_pct, self.peak_torque];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(ExoError::InvalidParameter(format!(
                "non-finite profile parameter in {self:?}"
            )));
        }
        if self.onset_pct < 0.0 {
            return Err(ExoError::InvalidParameter(format!(
                "onset {:.3}% is negative",
                self.onset_pct
            )));
        }
        if self.rise_pct <= 0.0 || self.fall_pct <= 0.0 {
            return Err(ExoError::InvalidParameter(format!(
                "rise {:.3}% and fall {:.3}% must be positive",
                self.rise_pct, self.fall_pct
            )));
        }
        if self.end_pct() > 100.0 {
            return Err(ExoError::InvalidParameter(format!(
                "end {:.3}% exceeds the stride",
                self.end_pct()
            )));
        }
        if self.peak_torque < 0.0 {
            return Err(ExoError::InvalidParameter(format!(
                "peak torque {:.3} is negative",
                self.peak_torque
            )));
        }
        Ok(())
    }

    /// Copy with the varied dimension replaced, re-validated.
    pub fn with_condition(&self, condition: Condition, value: f64) -> Result<Self, ExoError> {
        let mut next = *self;
        match condition {
            Condition::Onset => next.onset_pct = value,
            Condition::Rise => next.rise_pct = value,
            Condition::Fall => next.fall_pct = value,
        }
        next.validate()?;
        Ok(next)
    }

    pub fn value_of(&self, condition: Condition) -> f64 {
        match condition {
            Condition::Onset => self.onset_pct,
            Condition::Rise => self.rise_pct,
            Condition::Fall => self.fall_pct,
        }
    }

    pub fn onset_pct(&self) -> f64 {
        self.onset_pct
    }

    pub fn rise_pct(&self) -> f64 {
        self.rise_pct
    }

    pub fn fall_pct(&self) -> f64 {
        self.fall_pct
    }

    pub fn peak_pct(&self) -> f64 {
        self.onset_pct + self.rise_pct
    }

    pub fn end_pct(&self) -> f64 {
        self.peak_pct() + self.fall_pct
    }

    pub fn peak_torque(&self) -> f64 {
        self.peak_torque
    }
}

/// Evaluates a [`ProfileParameters`] with a fixed ramp shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TorqueProfile {
    pub shape: ProfileShape,
}

impl TorqueProfile {
    pub fn new(shape: ProfileShape) -> Self {
        Self { shape }
    }

    /// Commanded torque at `percent_gait`. Negative or non-finite phase
    /// (undetermined gait) yields zero.
    pub fn evaluate(&self, percent_gait: f64, params: &ProfileParameters) -> f64 {
        if !percent_gait.is_finite() {
            return 0.0;
        }
        let onset = params.onset_pct();
        let peak = params.peak_pct();
        let end = params.end_pct();
        if percent_gait < onset || percent_gait >= end {
            return 0.0;
        }
        if percent_gait < peak {
            let s = (percent_gait - onset) / params.rise_pct();
            params.peak_torque() * self.rise(s)
        } else {
            let s = (percent_gait - peak) / params.fall_pct();
            params.peak_torque() * self.fall(s)
        }
    }

    /// 0 -> 1 over `s` in `[0, 1]`.
    fn rise(&self, s: f64) -> f64 {
        let s = s.clamp(0.0, 1.0);
        match self.shape {
            ProfileShape::Linear => s,
            ProfileShape::Smooth => 0.5 * (1.0 - (PI * s).cos()),
            ProfileShape::Cubic => s * s * (3.0 - 2.0 * s),
        }
    }

    /// 1 -> 0 over `s` in `[0, 1]`.
    fn fall(&self, s: f64) -> f64 {
        let s = s.clamp(0.0, 1.0);
        match self.shape {
            ProfileShape::Linear => 1.0 - s,
            ProfileShape::Smooth => 0.5 * (1.0 + (PI * s).cos()),
            ProfileShape::Cubic => 1.0 - 1.5 * s * s + 0.5 * s * s * s,
        }
    }
}

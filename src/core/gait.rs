//! Gait-phase estimation from the sagittal gyro signal.
//!
//! A heel strike is the swing-phase positive lobe followed by a sharp negative
//! spike at ground contact. Detection arms on the positive lobe and fires on
//! the negative crossing; the stride duration is then tracked with an
//! outlier-gated exponential average and the phase is extrapolated from the
//! last heel strike.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::GaitConfig;
use crate::core::sample::InertialSample;

/// Highest percent reported inside a stride; avoids an exact 100 -> 0 wrap.
pub const MAX_PERCENT: f64 = 99.999;

/// Percent reported while no stride estimate exists.
pub const UNKNOWN_PERCENT: f64 = -1.0;

/// Estimator faults. Recoverable: the control loop commands zero torque and
/// keeps feeding samples.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum SensorFault {
    /// Non-finite value or timestamp not strictly increasing.
    #[error("invalid inertial sample")]
    InvalidSample,
    /// Phase ran past the expected heel strike beyond the slack margin.
    #[error("phase overrun at {percent_gait:.1}% of the expected stride")]
    PhaseOverrun { percent_gait: f64 },
    /// No heel strike for longer than the stale multiple of the stride estimate.
    #[error("no heel strike for {elapsed_s:.2}s")]
    StrideTimeout { elapsed_s: f64 },
}

/// Phase estimate for one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GaitPhase {
    /// No stride estimate yet: actuation must stay off.
    Unknown,
    /// Inside the expected stride, `[0, MAX_PERCENT]`.
    Stride(f64),
    /// Past the expected heel strike but within the slack margin.
    Overrun(f64),
}

impl GaitPhase {
    pub fn percent(self) -> f64 {
        match self {
            Self::Unknown => UNKNOWN_PERCENT,
            Self::Stride(p) | Self::Overrun(p) => p,
        }
    }
}

/// Threshold-and-hysteresis heel-strike detector over a rolling look-back buffer.
#[derive(Debug, Clone)]
pub struct HeelStrikeDetector {
    arm_threshold: f64,
    trigger_threshold: f64,
    lookback_s: f64,
    min_armed_fraction: f64,
    buffer: VecDeque<(f64, f64)>,
}

impl HeelStrikeDetector {
    pub fn new(cfg: &GaitConfig) -> Self {
        Self {
            arm_threshold: cfg.arm_threshold,
            trigger_threshold: cfg.trigger_threshold,
            lookback_s: cfg.lookback_s,
            min_armed_fraction: cfg.min_armed_fraction,
            buffer: VecDeque::with_capacity(256),
        }
    }

    /// Push one sample; returns true when it completes a heel-strike signature.
    pub fn push(&mut self, t: f64, gyro_z: f64, stride_estimate_s: Option<f64>) -> bool {
        while let Some(&(t0, _)) = self.buffer.front() {
            if t - t0 > self.lookback_s {
                self.buffer.pop_front();
            } else {
                break;
            }
        }

        if gyro_z <= self.trigger_threshold {
            let armed_since = self
                .buffer
                .iter()
                .find(|(_, g)| *g >= self.arm_threshold)
                .map(|(t0, _)| *t0);
            if let Some(t_arm) = armed_since {
                // Either way the arming is consumed.
                self.buffer.clear();
                let required = stride_estimate_s.map_or(0.0, |s| s * self.min_armed_fraction);
                let armed_for = t - t_arm;
                if armed_for >= required {
                    return true;
                }
                debug!(
                    target: "gait",
                    "trigger ignored: armed {armed_for:.3}s < required {required:.3}s"
                );
                return false;
            }
        }

        self.buffer.push_back((t, gyro_z));
        false
    }

    pub fn is_armed(&self) -> bool {
        self.buffer.iter().any(|(_, g)| *g >= self.arm_threshold)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Estimator state; persists across strides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GaitState {
    pub last_heel_strike_s: Option<f64>,
    pub stride_estimate_s: Option<f64>,
    /// `[0, MAX_PERCENT]`, or `UNKNOWN_PERCENT` before the first estimate.
    pub percent_gait: f64,
    pub last_stride_s: Option<f64>,
    pub heel_strikes: u64,
}

#[derive(Debug, Clone)]
pub struct GaitPhaseEstimator {
    cfg: GaitConfig,
    detector: HeelStrikeDetector,
    state: GaitState,
    last_timestamp_s: Option<f64>,
    rejected_in_row: u32,
    lock_lost: bool,
    heel_strike: bool,
}

impl GaitPhaseEstimator {
    pub fn new(cfg: GaitConfig) -> Self {
        Self {
            detector: HeelStrikeDetector::new(&cfg),
            cfg,
            state: GaitState {
                percent_gait: UNKNOWN_PERCENT,
                ..GaitState::default()
            },
            last_timestamp_s: None,
            rejected_in_row: 0,
            lock_lost: false,
            heel_strike: false,
        }
    }

    /// Advance with one sample and report the phase at its timestamp.
    pub fn update(&mut self, sample: &InertialSample) -> Result<GaitPhase, SensorFault> {
        self.heel_strike = false;
        if !sample.is_finite() {
            return Err(SensorFault::InvalidSample);
        }
        if let Some(prev) = self.last_timestamp_s {
            if sample.timestamp_s <= prev {
                return Err(SensorFault::InvalidSample);
            }
        }
        let t = sample.timestamp_s;
        self.last_timestamp_s = Some(t);

        if self
            .detector
            .push(t, sample.gyro_z, self.state.stride_estimate_s)
        {
            self.heel_strike = true;
            self.on_heel_strike(t);
        }
        self.phase_at(t)
    }

    /// Whether the last `update` detected a heel strike.
    pub fn heel_strike_detected(&self) -> bool {
        self.heel_strike
    }

    pub fn state(&self) -> &GaitState {
        &self.state
    }

    pub fn stride_estimate_s(&self) -> Option<f64> {
        self.state.stride_estimate_s
    }

    pub fn heel_strikes(&self) -> u64 {
        self.state.heel_strikes
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.cfg.clone());
    }

    fn on_heel_strike(&mut self, t: f64) {
        if let Some(prev) = self.state.last_heel_strike_s {
            let elapsed = t - prev;
            self.state.last_stride_s = Some(elapsed);
            if self.lock_lost {
                debug!(target: "gait", "stride {elapsed:.3}s after lost lock not used");
            } else {
                self.update_stride(elapsed);
            }
        }
        self.lock_lost = false;
        self.state.last_heel_strike_s = Some(t);
        self.state.heel_strikes += 1;
        self.state.percent_gait = 0.0;
        debug!(
            target: "gait",
            "heel strike #{} at {t:.3}s, stride estimate {:?}",
            self.state.heel_strikes,
            self.state.stride_estimate_s
        );
    }

    fn update_stride(&mut self, elapsed: f64) {
        if elapsed < self.cfg.min_stride_s || elapsed > self.cfg.max_stride_s {
            debug!(target: "gait", "stride {elapsed:.3}s outside admissible bounds");
            return;
        }
        let next = match self.state.stride_estimate_s {
            None => elapsed,
            Some(est) => {
                let low = self.cfg.outlier_low * est;
                let high = self.cfg.outlier_high * est;
                if (low..=high).contains(&elapsed) {
                    self.rejected_in_row = 0;
                    self.cfg.smoothing_alpha * elapsed + (1.0 - self.cfg.smoothing_alpha) * est
                } else {
                    self.rejected_in_row += 1;
                    if self.rejected_in_row < self.cfg.max_rejected_strides {
                        debug!(
                            target: "gait",
                            "outlier stride {elapsed:.3}s rejected (estimate {est:.3}s)"
                        );
                        return;
                    }
                    info!(
                        target: "gait",
                        "{} strides rejected in a row; re-seeding estimate at {elapsed:.3}s",
                        self.rejected_in_row
                    );
                    self.rejected_in_row = 0;
                    elapsed
                }
            }
        };
        self.state.stride_estimate_s = Some(next.max(self.cfg.min_stride_s));
    }

    fn phase_at(&mut self, t: f64) -> Result<GaitPhase, SensorFault> {
        let (Some(last), Some(est)) = (self.state.last_heel_strike_s, self.state.stride_estimate_s)
        else {
            self.state.percent_gait = UNKNOWN_PERCENT;
            return Ok(GaitPhase::Unknown);
        };
        let elapsed = t - last;
        let raw = 100.0 * elapsed / est;
        if raw < 100.0 {
            let pct = raw.clamp(0.0, MAX_PERCENT);
            self.state.percent_gait = pct;
            return Ok(GaitPhase::Stride(pct));
        }
        self.state.percent_gait = MAX_PERCENT;
        if raw <= 100.0 + self.cfg.overrun_slack_pct {
            Ok(GaitPhase::Overrun(raw))
        } else if raw <= 100.0 * self.cfg.stale_stride_multiple {
            Err(SensorFault::PhaseOverrun { percent_gait: raw })
        } else {
            if !self.lock_lost {
                warn!(
                    target: "gait",
                    "no heel strike for {elapsed:.2}s (estimate {est:.2}s); gait lock lost"
                );
                self.lock_lost = true;
            }
            Err(SensorFault::StrideTimeout { elapsed_s: elapsed })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const DT: f64 = 0.01;

    fn cfg() -> GaitConfig {
        GaitConfig::default()
    }

    /// Square-wave gait: arming lobe 40..20 samples before each strike, spike at the strike.
    fn gyro_at(k: u64, period: u64) -> f64 {
        let m = k % period;
        if k > 0 && m == 0 {
            -12.0
        } else if m >= period - 40 && m < period - 20 {
            6.0
        } else {
            0.0
        }
    }

    fn feed(est: &mut GaitPhaseEstimator, from: u64, to: u64, period: u64) -> Vec<u64> {
        let mut strikes = Vec::new();
        for k in from..to {
            let s = InertialSample::new(k as f64 * DT, gyro_at(k, period));
            let _ = est.update(&s);
            if est.heel_strike_detected() {
                strikes.push(k);
            }
        }
        strikes
    }

    #[test]
    fn detector_requires_arming() {
        let mut det = HeelStrikeDetector::new(&cfg());
        assert!(!det.push(0.00, 0.0, None));
        assert!(!det.push(0.01, -20.0, None));
        assert!(!det.push(0.02, 8.0, None));
        assert!(det.is_armed());
        assert!(det.push(0.30, -20.0, None));
        assert!(!det.is_armed());
    }

    #[test]
    fn detector_does_not_double_count_spike_train() {
        let mut det = HeelStrikeDetector::new(&cfg());
        det.push(0.0, 8.0, None);
        let fired: usize = (1..6)
            .filter(|i| det.push(0.2 + *i as f64 * DT, -15.0, None))
            .count();
        assert_eq!(fired, 1);
    }

    #[test]
    fn detector_forgets_arming_outside_lookback() {
        let mut det = HeelStrikeDetector::new(&cfg());
        det.push(0.0, 8.0, None);
        det.push(0.5, 0.0, None);
        assert!(!det.push(1.2, -15.0, None));
    }

    #[test]
    fn short_arming_is_treated_as_noise() {
        let mut det = HeelStrikeDetector::new(&cfg());
        det.push(0.00, 8.0, Some(1.0));
        // Armed for 0.05s < 10% of 1.0s.
        assert!(!det.push(0.05, -15.0, Some(1.0)));
        // The spike consumed the arming.
        assert!(!det.push(0.30, -15.0, Some(1.0)));
    }

    #[test]
    fn phase_unknown_until_first_stride_completes() {
        let mut est = GaitPhaseEstimator::new(cfg());
        let strikes = feed(&mut est, 0, 121, 120);
        assert_eq!(strikes, vec![120]);
        assert_eq!(est.stride_estimate_s(), None);
        assert_eq!(est.state().percent_gait, UNKNOWN_PERCENT);
        let p = est.update(&InertialSample::new(1.25, 0.0)).unwrap();
        assert_eq!(p, GaitPhase::Unknown);
        assert_eq!(p.percent(), -1.0);
    }

    #[test]
    fn first_stride_seeds_estimate_then_ema() {
        let mut est = GaitPhaseEstimator::new(cfg());
        feed(&mut est, 0, 241, 120);
        assert_abs_diff_eq!(est.stride_estimate_s().unwrap(), 1.2, epsilon = 1e-9);

        // One 1.4s stride: accepted (within 1.5x) and blended.
        let mut e2 = est.clone();
        let mut k = 241;
        while k < 380 {
            let g = if (340..360).contains(&k) { 6.0 } else { 0.0 };
            e2.update(&InertialSample::new(k as f64 * DT, g)).ok();
            k += 1;
        }
        e2.update(&InertialSample::new(3.80, -12.0)).ok();
        assert!(e2.heel_strike_detected());
        let alpha = cfg().smoothing_alpha;
        let expected = alpha * 1.4 + (1.0 - alpha) * 1.2;
        assert_abs_diff_eq!(e2.stride_estimate_s().unwrap(), expected, epsilon = 1e-6);
    }

    #[test]
    fn outlier_strides_are_rejected_then_reseeded() {
        let mut c = cfg();
        c.max_rejected_strides = 2;
        let mut est = GaitPhaseEstimator::new(c);
        // 1.0s strides to lock in the estimate.
        feed(&mut est, 0, 301, 100);
        assert_abs_diff_eq!(est.stride_estimate_s().unwrap(), 1.0, epsilon = 1e-9);

        // Switch to 1.7s strides (> 1.5x): first rejected, second re-seeds.
        let mut t = 3.0;
        for n in 0..2 {
            for i in 1..170 {
                let tt = t + i as f64 * DT;
                let g = if (130..150).contains(&i) { 6.0 } else { 0.0 };
                let _ = est.update(&InertialSample::new(tt, g));
            }
            t += 1.7;
            let _ = est.update(&InertialSample::new(t, -12.0));
            assert!(est.heel_strike_detected());
            if n == 0 {
                assert_abs_diff_eq!(est.stride_estimate_s().unwrap(), 1.0, epsilon = 1e-9);
            }
        }
        assert_abs_diff_eq!(est.stride_estimate_s().unwrap(), 1.7, epsilon = 1e-6);
    }

    #[test]
    fn missed_heel_strike_is_surfaced() {
        let mut est = GaitPhaseEstimator::new(cfg());
        feed(&mut est, 0, 241, 120);
        let last = est.state().last_heel_strike_s.unwrap();

        let p = est.update(&InertialSample::new(last + 1.25, 0.0)).unwrap();
        assert!(matches!(p, GaitPhase::Overrun(v) if v > 100.0));

        let err = est.update(&InertialSample::new(last + 1.5, 0.0)).unwrap_err();
        assert!(matches!(err, SensorFault::PhaseOverrun { percent_gait } if percent_gait > 110.0));

        let err = est.update(&InertialSample::new(last + 2.5, 0.0)).unwrap_err();
        assert!(matches!(err, SensorFault::StrideTimeout { .. }));
        assert!(est.state().percent_gait < 100.0);
    }

    #[test]
    fn stride_after_lost_lock_keeps_estimate() {
        let mut est = GaitPhaseEstimator::new(cfg());
        feed(&mut est, 0, 241, 120);
        let last = est.state().last_heel_strike_s.unwrap();
        let _ = est.update(&InertialSample::new(last + 3.0, 0.0));
        let _ = est.update(&InertialSample::new(last + 3.1, 8.0));
        let _ = est.update(&InertialSample::new(last + 3.4, -12.0));
        assert!(est.heel_strike_detected());
        assert_abs_diff_eq!(est.stride_estimate_s().unwrap(), 1.2, epsilon = 1e-9);
        let p = est.update(&InertialSample::new(last + 3.4 + 0.6, 0.0)).unwrap();
        assert_abs_diff_eq!(p.percent(), 50.0, epsilon = 1e-6);
    }

    #[test]
    fn invalid_samples_are_rejected_without_advancing() {
        let mut est = GaitPhaseEstimator::new(cfg());
        est.update(&InertialSample::new(0.10, 0.0)).unwrap();
        assert_eq!(
            est.update(&InertialSample::new(0.05, 0.0)),
            Err(SensorFault::InvalidSample)
        );
        assert_eq!(
            est.update(&InertialSample::new(0.10, 0.0)),
            Err(SensorFault::InvalidSample)
        );
        assert_eq!(
            est.update(&InertialSample::new(0.20, f64::NAN)),
            Err(SensorFault::InvalidSample)
        );
        assert!(est.update(&InertialSample::new(0.11, 0.0)).is_ok());
    }
}

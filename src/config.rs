use crate::control::ControlLoop;
use crate::core::profile::{Condition, ProfileParameters, ProfileShape};
use crate::error::ExoError;
use crate::trial::runner::ComparisonWindow;
use crate::trial::staircase::{Direction, Directionality, SameResponse};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlConfig {
    #[serde(default = "ControlConfig::default_frequency_hz")]
    pub frequency_hz: f64,
    #[serde(default = "ControlConfig::default_io_timeout_ms")]
    pub io_timeout_ms: f64,
    #[serde(default = "ControlConfig::default_max_consecutive_timeouts")]
    pub max_consecutive_timeouts: u32,
    #[serde(default)]
    pub profile_shape: ProfileShape,
    #[serde(default = "ControlConfig::default_max_torque_nm")]
    pub max_torque_nm: f64,
}

impl ControlConfig {
    fn default_frequency_hz() -> f64 {
        100.0
    }
    fn default_io_timeout_ms() -> f64 {
        3.0
    }
    fn default_max_consecutive_timeouts() -> u32 {
        3
    }
    fn default_max_torque_nm() -> f64 {
        40.0
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.io_timeout_ms.max(0.0) / 1000.0)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            frequency_hz: Self::default_frequency_hz(),
            io_timeout_ms: Self::default_io_timeout_ms(),
            max_consecutive_timeouts: Self::default_max_consecutive_timeouts(),
            profile_shape: ProfileShape::default(),
            max_torque_nm: Self::default_max_torque_nm(),
        }
    }
}

/// Heel-strike detection and stride tracking. Thresholds are in the
/// device's scaled gyro units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GaitConfig {
    #[serde(default = "GaitConfig::default_arm_threshold")]
    pub arm_threshold: f64,
    #[serde(default = "GaitConfig::default_trigger_threshold")]
    pub trigger_threshold: f64,
    #[serde(default = "GaitConfig::default_lookback_s")]
    pub lookback_s: f64,
    #[serde(default = "GaitConfig::default_min_armed_fraction")]
    pub min_armed_fraction: f64,
    #[serde(default = "GaitConfig::default_smoothing_alpha")]
    pub smoothing_alpha: f64,
    #[serde(default = "GaitConfig::default_min_stride_s")]
    pub min_stride_s: f64,
    #[serde(default = "GaitConfig::default_max_stride_s")]
    pub max_stride_s: f64,
    #[serde(default = "GaitConfig::default_outlier_low")]
    pub outlier_low: f64,
    #[serde(default = "GaitConfig::default_outlier_high")]
    pub outlier_high: f64,
    #[serde(default = "GaitConfig::default_max_rejected_strides")]
    pub max_rejected_strides: u32,
    #[serde(default = "GaitConfig::default_overrun_slack_pct")]
    pub overrun_slack_pct: f64,
    #[serde(default = "GaitConfig::default_stale_stride_multiple")]
    pub stale_stride_multiple: f64,
}

impl GaitConfig {
    fn default_arm_threshold() -> f64 {
        150.0 / 32.8
    }
    fn default_trigger_threshold() -> f64 {
        -300.0 / 32.8
    }
    fn default_lookback_s() -> f64 {
        1.0
    }
    fn default_min_armed_fraction() -> f64 {
        0.10
    }
    fn default_smoothing_alpha() -> f64 {
        0.4
    }
    fn default_min_stride_s() -> f64 {
        0.4
    }
    fn default_max_stride_s() -> f64 {
        3.0
    }
    fn default_outlier_low() -> f64 {
        0.5
    }
    fn default_outlier_high() -> f64 {
        1.5
    }
    fn default_max_rejected_strides() -> u32 {
        3
    }
    fn default_overrun_slack_pct() -> f64 {
        10.0
    }
    fn default_stale_stride_multiple() -> f64 {
        2.0
    }
}

impl Default for GaitConfig {
    fn default() -> Self {
        Self {
            arm_threshold: Self::default_arm_threshold(),
            trigger_threshold: Self::default_trigger_threshold(),
            lookback_s: Self::default_lookback_s(),
            min_armed_fraction: Self::default_min_armed_fraction(),
            smoothing_alpha: Self::default_smoothing_alpha(),
            min_stride_s: Self::default_min_stride_s(),
            max_stride_s: Self::default_max_stride_s(),
            outlier_low: Self::default_outlier_low(),
            outlier_high: Self::default_outlier_high(),
            max_rejected_strides: Self::default_max_rejected_strides(),
            overrun_slack_pct: Self::default_overrun_slack_pct(),
            stale_stride_multiple: Self::default_stale_stride_multiple(),
        }
    }
}

/// Fixed profile dimensions; the staircase condition overrides one of them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileConfig {
    #[serde(default = "ProfileConfig::default_user_weight_kg")]
    pub user_weight_kg: f64,
    /// Peak torque normalized by body mass (Nm/kg).
    #[serde(default = "ProfileConfig::default_peak_torque_norm")]
    pub peak_torque_norm: f64,
    #[serde(default = "ProfileConfig::default_onset_pct")]
    pub onset_pct: f64,
    #[serde(default = "ProfileConfig::default_rise_pct")]
    pub rise_pct: f64,
    #[serde(default = "ProfileConfig::default_fall_pct")]
    pub fall_pct: f64,
}

impl ProfileConfig {
    fn default_user_weight_kg() -> f64 {
        70.0
    }
    fn default_peak_torque_norm() -> f64 {
        0.225
    }
    fn default_onset_pct() -> f64 {
        26.0
    }
    fn default_rise_pct() -> f64 {
        25.3
    }
    fn default_fall_pct() -> f64 {
        10.3
    }

    pub fn peak_torque_nm(&self) -> f64 {
        self.peak_torque_norm * self.user_weight_kg
    }

    pub fn to_parameters(&self) -> Result<ProfileParameters, ExoError> {
        ProfileParameters::new(
            self.onset_pct,
            self.rise_pct,
            self.fall_pct,
            self.peak_torque_nm(),
        )
    }
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            user_weight_kg: Self::default_user_weight_kg(),
            peak_torque_norm: Self::default_peak_torque_norm(),
            onset_pct: Self::default_onset_pct(),
            rise_pct: Self::default_rise_pct(),
            fall_pct: Self::default_fall_pct(),
        }
    }
}

/// Admissible range for the tested parameter, written as `[min, max]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct ParameterRange {
    pub min: f64,
    pub max: f64,
}

impl ParameterRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn clamp(&self, v: f64) -> f64 {
        v.clamp(self.min, self.max)
    }

    pub fn contains(&self, v: f64) -> bool {
        (self.min..=self.max).contains(&v)
    }
}

impl From<[f64; 2]> for ParameterRange {
    fn from([min, max]: [f64; 2]) -> Self {
        Self { min, max }
    }
}

impl From<ParameterRange> for [f64; 2] {
    fn from(r: ParameterRange) -> Self {
        [r.min, r.max]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaircaseConfig {
    #[serde(default)]
    pub condition: Condition,
    #[serde(default = "StaircaseConfig::default_parameter_range")]
    pub parameter_range: ParameterRange,
    /// Starting value; falls back to the profile value of `condition`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<f64>,
    #[serde(default = "StaircaseConfig::default_initial_step_size")]
    pub initial_step_size: f64,
    #[serde(default = "StaircaseConfig::default_step_reduction_factor")]
    pub step_reduction_factor: f64,
    /// Reduce the step after every N reversals; 0 disables reduction.
    #[serde(default)]
    pub reversals_per_reduction: u32,
    #[serde(default = "StaircaseConfig::default_min_step_size")]
    pub min_step_size: f64,
    #[serde(default = "StaircaseConfig::default_reversal_target")]
    pub reversal_target: u32,
    /// K: number of trailing reversal values averaged into the threshold.
    #[serde(default = "StaircaseConfig::default_threshold_reversals")]
    pub threshold_reversals: u32,
    #[serde(default = "StaircaseConfig::default_max_trials")]
    pub max_trials: u32,
    #[serde(default)]
    pub directionality: Directionality,
    #[serde(default)]
    pub initial_direction: Direction,
    #[serde(default)]
    pub same_response: SameResponse,
}

impl StaircaseConfig {
    fn default_parameter_range() -> ParameterRange {
        ParameterRange::new(10.0, 40.0)
    }
    fn default_initial_step_size() -> f64 {
        2.0
    }
    fn default_step_reduction_factor() -> f64 {
        0.5
    }
    fn default_min_step_size() -> f64 {
        0.25
    }
    fn default_reversal_target() -> u32 {
        8
    }
    fn default_threshold_reversals() -> u32 {
        6
    }
    fn default_max_trials() -> u32 {
        40
    }
}

impl Default for StaircaseConfig {
    fn default() -> Self {
        Self {
            condition: Condition::default(),
            parameter_range: Self::default_parameter_range(),
            initial_value: None,
            initial_step_size: Self::default_initial_step_size(),
            step_reduction_factor: Self::default_step_reduction_factor(),
            reversals_per_reduction: 0,
            min_step_size: Self::default_min_step_size(),
            reversal_target: Self::default_reversal_target(),
            threshold_reversals: Self::default_threshold_reversals(),
            max_trials: Self::default_max_trials(),
            directionality: Directionality::default(),
            initial_direction: Direction::default(),
            same_response: SameResponse::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    #[serde(default = "SessionSettings::default_participant_id")]
    pub participant_id: String,
    #[serde(default = "SessionSettings::default_warmup_strides")]
    pub warmup_strides: u32,
    #[serde(default = "SessionSettings::default_output_dir")]
    pub output_dir: String,
    #[serde(default)]
    pub window: ComparisonWindow,
}

impl SessionSettings {
    fn default_participant_id() -> String {
        "P000".to_string()
    }
    fn default_warmup_strides() -> u32 {
        10
    }
    fn default_output_dir() -> String {
        "data".to_string()
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            participant_id: Self::default_participant_id(),
            warmup_strides: Self::default_warmup_strides(),
            output_dir: Self::default_output_dir(),
            window: ComparisonWindow::default(),
        }
    }
}

/// Parameters of the simulated boot used without hardware.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationConfig {
    #[serde(default = "SimulationConfig::default_stride_s")]
    pub stride_s: f64,
    #[serde(default = "SimulationConfig::default_stride_jitter_s")]
    pub stride_jitter_s: f64,
    #[serde(default = "SimulationConfig::default_gyro_noise")]
    pub gyro_noise: f64,
    #[serde(default)]
    pub gyro_bias: f64,
    #[serde(default = "SimulationConfig::default_seed")]
    pub seed: u64,
    /// Measured motor current per Nm of commanded torque (A/Nm).
    #[serde(default = "SimulationConfig::default_current_per_nm")]
    pub current_per_nm: f64,
}

impl SimulationConfig {
    fn default_stride_s() -> f64 {
        1.1
    }
    fn default_stride_jitter_s() -> f64 {
        0.02
    }
    fn default_gyro_noise() -> f64 {
        0.3
    }
    fn default_seed() -> u64 {
        7
    }
    fn default_current_per_nm() -> f64 {
        0.6
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            stride_s: Self::default_stride_s(),
            stride_jitter_s: Self::default_stride_jitter_s(),
            gyro_noise: Self::default_gyro_noise(),
            gyro_bias: 0.0,
            seed: Self::default_seed(),
            current_per_nm: Self::default_current_per_nm(),
        }
    }
}

/// Full session configuration; supplied once at start and immutable after.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionConfig {
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub gait: GaitConfig,
    #[serde(default)]
    pub profile: ProfileConfig,
    #[serde(default)]
    pub staircase: StaircaseConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl SessionConfig {
    fn format_f64_compact(x: f64) -> String {
        let mut s = format!("{:.6}", x);
        while s.contains('.') && s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
        if s.is_empty() { "0".to_string() } else { s }
    }

    /// Strict load: missing or malformed files are errors.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ExoError> {
        let contents = fs::read_to_string(path.as_ref())?;
        let cfg: Self = toml::from_str(&contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_or_default(path: &str) -> Self {
        let path_obj = Path::new(path);
        if path_obj.exists() {
            match fs::read_to_string(path_obj) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(cfg) => return cfg,
                    Err(err) => {
                        warn!("Failed to parse config {path}: {err}. Using defaults.");
                    }
                },
                Err(err) => {
                    warn!("Failed to read config {path}: {err}. Using defaults.");
                }
            }
            return Self::default();
        }

        // File does not exist: write defaults as a commented template.
        let default_cfg = Self::default();
        match default_cfg.commented_template() {
            Some(text) => {
                if let Err(err) = fs::write(path_obj, text) {
                    warn!("Failed to write default config to {path}: {err}");
                }
            }
            None => warn!("Failed to serialize default config; continuing with defaults"),
        }
        default_cfg
    }

    fn commented_template(&self) -> Option<String> {
        let text = toml::to_string_pretty(self).ok()?;
        let mut commented = String::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                commented.push('\n');
            } else if trimmed.starts_with('[') && trimmed.ends_with(']') {
                commented.push_str(line);
                commented.push('\n');
            } else {
                let mut out_line = line.to_string();
                if let Some((lhs, rhs)) = line.split_once('=') {
                    let rhs_trim = rhs.trim();
                    let has_decimal = rhs_trim.contains('.');
                    if (has_decimal || rhs_trim.contains('e') || rhs_trim.contains('E'))
                        && !rhs_trim.contains('"')
                        && !rhs_trim.starts_with('[')
                        && rhs_trim != "true"
                        && rhs_trim != "false"
                    {
                        if let Ok(val) = rhs_trim.parse::<f64>() {
                            let mut formatted = Self::format_f64_compact(val);
                            if has_decimal && !formatted.contains('.') {
                                formatted.push_str(".0");
                            }
                            out_line = format!("{} = {}", lhs.trim(), formatted);
                        }
                    }
                }
                commented.push_str("# ");
                commented.push_str(&out_line);
                commented.push('\n');
            }
        }
        Some(commented)
    }

    /// Base profile for the session, before the staircase overrides its dimension.
    pub fn base_profile(&self) -> Result<ProfileParameters, ExoError> {
        self.profile.to_parameters()
    }

    pub fn initial_value(&self) -> f64 {
        self.staircase
            .initial_value
            .unwrap_or_else(|| self.profile_value(self.staircase.condition))
    }

    fn profile_value(&self, condition: Condition) -> f64 {
        match condition {
            Condition::Onset => self.profile.onset_pct,
            Condition::Rise => self.profile.rise_pct,
            Condition::Fall => self.profile.fall_pct,
        }
    }

    pub fn validate(&self) -> Result<(), ExoError> {
        let c = &self.control;
        if !(c.frequency_hz.is_finite() && c.frequency_hz > 0.0) {
            return Err(ExoError::invalid_config("control.frequency_hz must be > 0"));
        }
        if !(c.io_timeout_ms.is_finite() && c.io_timeout_ms > 0.0) {
            return Err(ExoError::invalid_config("control.io_timeout_ms must be > 0"));
        }
        let period_ms = 1000.0 / c.frequency_hz;
        let calls = ControlLoop::MAX_IO_CALLS_PER_TICK;
        if f64::from(calls) * c.io_timeout_ms > period_ms {
            return Err(ExoError::invalid_config(format!(
                "{calls} I/O timeouts ({} ms each) do not fit the {period_ms:.2} ms tick",
                c.io_timeout_ms
            )));
        }
        if c.max_consecutive_timeouts == 0 {
            return Err(ExoError::invalid_config(
                "control.max_consecutive_timeouts must be >= 1",
            ));
        }
        if !(c.max_torque_nm.is_finite() && c.max_torque_nm > 0.0) {
            return Err(ExoError::invalid_config("control.max_torque_nm must be > 0"));
        }

        let g = &self.gait;
        if !(g.arm_threshold > 0.0 && g.trigger_threshold < 0.0) {
            return Err(ExoError::invalid_config(
                "gait thresholds need arm > 0 > trigger",
            ));
        }
        if !(g.lookback_s > 0.0) {
            return Err(ExoError::invalid_config("gait.lookback_s must be > 0"));
        }
        if !(0.0..1.0).contains(&g.min_armed_fraction) {
            return Err(ExoError::invalid_config(
                "gait.min_armed_fraction must be in [0, 1)",
            ));
        }
        if !(g.smoothing_alpha > 0.0 && g.smoothing_alpha <= 1.0) {
            return Err(ExoError::invalid_config(
                "gait.smoothing_alpha must be in (0, 1]",
            ));
        }
        if !(g.min_stride_s > 0.0 && g.max_stride_s > g.min_stride_s) {
            return Err(ExoError::invalid_config(
                "gait stride bounds need 0 < min_stride_s < max_stride_s",
            ));
        }
        if !(g.outlier_low > 0.0 && g.outlier_low < 1.0 && g.outlier_high > 1.0) {
            return Err(ExoError::invalid_config(
                "gait outlier gate needs 0 < outlier_low < 1 < outlier_high",
            ));
        }
        if g.overrun_slack_pct < 0.0 {
            return Err(ExoError::invalid_config("gait.overrun_slack_pct must be >= 0"));
        }
        if 100.0 * g.stale_stride_multiple <= 100.0 + g.overrun_slack_pct {
            return Err(ExoError::invalid_config(
                "gait.stale_stride_multiple must exceed the overrun slack",
            ));
        }

        if !(self.profile.user_weight_kg > 0.0) {
            return Err(ExoError::invalid_config("profile.user_weight_kg must be > 0"));
        }
        let base = self.base_profile()?;
        if base.peak_torque() > c.max_torque_nm {
            return Err(ExoError::invalid_config(format!(
                "peak torque {:.2} Nm exceeds control.max_torque_nm {:.2}",
                base.peak_torque(),
                c.max_torque_nm
            )));
        }

        let s = &self.staircase;
        let r = s.parameter_range;
        if !(r.min.is_finite() && r.max.is_finite() && r.min < r.max) {
            return Err(ExoError::invalid_config(
                "staircase.parameter_range needs min < max",
            ));
        }
        if !r.contains(self.initial_value()) {
            return Err(ExoError::invalid_config(format!(
                "staircase initial value {} outside [{}, {}]",
                self.initial_value(),
                r.min,
                r.max
            )));
        }
        if !(s.initial_step_size > 0.0 && s.min_step_size > 0.0) {
            return Err(ExoError::invalid_config(
                "staircase step sizes must be > 0",
            ));
        }
        if !(s.step_reduction_factor > 0.0 && s.step_reduction_factor <= 1.0) {
            return Err(ExoError::invalid_config(
                "staircase.step_reduction_factor must be in (0, 1]",
            ));
        }
        if s.reversal_target == 0 || s.threshold_reversals == 0 || s.max_trials == 0 {
            return Err(ExoError::invalid_config(
                "staircase reversal_target, threshold_reversals and max_trials must be >= 1",
            ));
        }
        // Every admissible value must produce a valid profile.
        for v in [r.min, r.max] {
            base.with_condition(s.condition, v)?;
        }

        if let ComparisonWindow::Seconds(sec) = self.session.window {
            if !(sec > 0.0) {
                return Err(ExoError::invalid_config("session.window seconds must be > 0"));
            }
        }
        if let ComparisonWindow::Strides(0) = self.session.window {
            return Err(ExoError::invalid_config("session.window strides must be >= 1"));
        }
        Ok(())
    }
}

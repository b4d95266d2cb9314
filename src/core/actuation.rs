//! Torque/current conversion helpers with explicit unit semantics.
//! - Torque is ankle torque in Nm; current is motor current in mA.
//! - Ankle torque reaches the motor through the cable transmission, whose
//!   ratio depends on ankle angle (see [`Transmission`]).
//! - Current commands are clamped to `[no_slack_ma, peak_ma]` so the cable
//!   keeps tension at zero torque and never exceeds the hardware limit.
//! - Gyro counts are divided by `gyro_lsb_per_unit`.

use serde::{Deserialize, Serialize};

/// Which ankle a boot is strapped to; sets the motor current sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Side {
    #[default]
    Left,
    Right,
}

impl Side {
    pub fn sign(self) -> i32 {
        match self {
            Self::Left => 1,
            Self::Right => -1,
        }
    }
}

/// Motor-to-ankle velocity ratio, the derivative of the fitted
/// motor-angle-vs-ankle-angle quintic. `poly` holds that quintic's
/// coefficients from the 5th order down to the linear term, in raw ankle
/// encoder ticks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transmission {
    pub poly: [f64; 5],
}

impl Transmission {
    /// Below this the fit is not trusted and a unit ratio is used.
    pub const MIN_RATIO: f64 = 0.5;

    pub fn constant(ratio: f64) -> Self {
        Self {
            poly: [0.0, 0.0, 0.0, 0.0, ratio],
        }
    }

    pub fn ratio_at(&self, ankle_ticks: f64) -> f64 {
        let [c5, c4, c3, c2, c1] = self.poly;
        let x = ankle_ticks;
        let ratio = (((5.0 * c5 * x + 4.0 * c4) * x + 3.0 * c3) * x + 2.0 * c2) * x + c1;
        if ratio.is_finite() && ratio > Self::MIN_RATIO {
            ratio
        } else {
            1.0
        }
    }
}

impl Default for Transmission {
    fn default() -> Self {
        Self::constant(18.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuatorCalibration {
    pub side: Side,
    /// q-axis torque constant (Nm/A) at the motor shaft.
    pub kt: f64,
    pub transmission: Transmission,
    /// Ratio between q-axis and driver current.
    pub driver_ratio: f64,
    pub no_slack_ma: f64,
    pub peak_ma: f64,
    pub zeroing_ma: f64,
    pub gyro_lsb_per_unit: f64,
}

impl Default for ActuatorCalibration {
    fn default() -> Self {
        Self {
            side: Side::Left,
            kt: 0.14,
            transmission: Transmission::default(),
            driver_ratio: std::f64::consts::SQRT_2 / 0.537,
            no_slack_ma: 1_200.0,
            peak_ma: 28_000.0,
            zeroing_ma: 1_800.0,
            gyro_lsb_per_unit: 32.8,
        }
    }
}

impl ActuatorCalibration {
    pub fn for_side(side: Side) -> Self {
        Self {
            side,
            ..Self::default()
        }
    }

    /// Unsigned driver current (mA) for an ankle torque at the given ankle
    /// position, before clamping.
    pub fn torque_to_current_ma(&self, torque_nm: f64, ankle_ticks: f64) -> f64 {
        let motor_nm = torque_nm / self.transmission.ratio_at(ankle_ticks);
        motor_nm / self.kt * self.driver_ratio * 1_000.0
    }

    /// Inverse of [`Self::torque_to_current_ma`].
    pub fn current_to_torque_nm(&self, current_ma: f64, ankle_ticks: f64) -> f64 {
        current_ma / 1_000.0 / self.driver_ratio * self.kt * self.transmission.ratio_at(ankle_ticks)
    }

    /// Signed, clamped motor command for an ankle torque.
    pub fn command_ma(&self, torque_nm: f64, ankle_ticks: f64) -> i32 {
        let torque = if torque_nm.is_finite() { torque_nm } else { 0.0 };
        let ma = self
            .torque_to_current_ma(torque, ankle_ticks)
            .clamp(self.no_slack_ma, self.peak_ma);
        ma.round() as i32 * self.side.sign()
    }

    pub fn gyro_to_units(&self, raw: i32) -> f64 {
        raw as f64 / self.gyro_lsb_per_unit
    }
}

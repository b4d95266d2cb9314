use std::time::Duration;

pub type Tick = u64;

/// Fixed control-rate clock. Ticks count control periods from session start.
#[derive(Clone, Copy, Debug)]
pub struct Timebase {
    pub control_hz: f64,
}

impl Timebase {
    pub fn new(control_hz: f64) -> Self {
        Self { control_hz }
    }

    pub fn period(&self) -> Duration {
        if !self.control_hz.is_finite() || self.control_hz <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(1.0 / self.control_hz)
    }

    pub fn period_sec(&self) -> f64 {
        self.period().as_secs_f64()
    }

    pub fn tick_to_sec(&self, t: Tick) -> f64 {
        t as f64 / self.control_hz
    }

    pub fn sec_to_tick(&self, s: f64) -> Tick {
        if s <= 0.0 || !s.is_finite() {
            return 0;
        }
        (s * self.control_hz).round() as Tick
    }
}

#[cfg(test)]
mod tests {
    use super::{Tick, Timebase};

    #[test]
    fn sec_tick_round_trip() {
        let tb = Timebase::new(100.0);
        let t: Tick = 12_345;
        let sec = tb.tick_to_sec(t);
        assert_eq!(tb.sec_to_tick(sec), t);
    }

    #[test]
    fn period_matches_rate() {
        let tb = Timebase::new(200.0);
        assert_eq!(tb.period().as_micros(), 5_000);
        assert_eq!(Timebase::new(0.0).period(), std::time::Duration::ZERO);
    }

    #[test]
    fn negative_seconds_clamp_to_zero() {
        let tb = Timebase::new(100.0);
        assert_eq!(tb.sec_to_tick(-1.0), 0);
        assert_eq!(tb.sec_to_tick(f64::NAN), 0);
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-window statistics of guard interventions.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CommandGuardStats {
    pub max_requested: f64,
    pub num_clamped: u64,
    pub num_non_finite: u64,
}

/// Shared counters so another thread can poll guard activity.
#[derive(Debug, Default)]
pub struct CommandGuardMeter {
    engaged_count: AtomicU64,
    clamped_count: AtomicU64,
    non_finite_count: AtomicU64,
    max_requested_bits: AtomicU64,
}

impl CommandGuardMeter {
    pub fn record(&self, stats: &CommandGuardStats) {
        if stats.num_clamped == 0 && stats.num_non_finite == 0 {
            return;
        }
        self.engaged_count.fetch_add(1, Ordering::Relaxed);
        self.clamped_count
            .fetch_add(stats.num_clamped, Ordering::Relaxed);
        self.non_finite_count
            .fetch_add(stats.num_non_finite, Ordering::Relaxed);
        let prev = f64::from_bits(self.max_requested_bits.load(Ordering::Relaxed));
        if stats.max_requested > prev {
            self.max_requested_bits
                .store(stats.max_requested.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn take_snapshot(&self) -> Option<CommandGuardStats> {
        let engaged = self.engaged_count.swap(0, Ordering::Relaxed);
        if engaged == 0 {
            return None;
        }
        Some(CommandGuardStats {
            max_requested: f64::from_bits(self.max_requested_bits.swap(0, Ordering::Relaxed)),
            num_clamped: self.clamped_count.swap(0, Ordering::Relaxed),
            num_non_finite: self.non_finite_count.swap(0, Ordering::Relaxed),
        })
    }
}

/// Last line before the device: commanded torque is finite and inside
/// `[0, max_torque_nm]`.
#[derive(Debug)]
pub struct CommandGuard {
    max_torque_nm: f64,
    stats: CommandGuardStats,
    meter: Option<Arc<CommandGuardMeter>>,
}

impl CommandGuard {
    pub fn new(max_torque_nm: f64) -> Self {
        Self {
            max_torque_nm: max_torque_nm.max(0.0),
            stats: CommandGuardStats::default(),
            meter: None,
        }
    }

    pub fn with_meter(mut self, meter: Arc<CommandGuardMeter>) -> Self {
        self.meter = Some(meter);
        self
    }

    /// The attached meter, attaching a fresh one if there is none.
    pub fn shared_meter(&mut self) -> Arc<CommandGuardMeter> {
        self.meter
            .get_or_insert_with(|| Arc::new(CommandGuardMeter::default()))
            .clone()
    }

    pub fn max_torque_nm(&self) -> f64 {
        self.max_torque_nm
    }

    pub fn apply(&mut self, torque_nm: f64) -> f64 {
        if !torque_nm.is_finite() {
            self.stats.num_non_finite += 1;
            return 0.0;
        }
        let out = torque_nm.clamp(0.0, self.max_torque_nm);
        if out != torque_nm {
            self.stats.num_clamped += 1;
            self.stats.max_requested = self.stats.max_requested.max(torque_nm.abs());
        }
        out
    }

    pub fn stats(&self) -> CommandGuardStats {
        self.stats
    }

    /// Hand accumulated stats to the meter (if any) and start over.
    pub fn flush(&mut self) -> CommandGuardStats {
        let stats = std::mem::take(&mut self.stats);
        if let Some(meter) = &self.meter {
            meter.record(&stats);
        }
        stats
    }
}

use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

/// Maps captured (source) time onto wall-clock (real) time.
///
/// The first source timestamp registered is pinned to the real time at which
/// it was registered; every other instant is placed relative to that pair,
/// with source intervals divided by the speedup factor.
#[derive(Debug)]
pub struct TimeShifter {
    anchor: OnceLock<Anchor>,
    speedup_factor: f64,
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    source: SystemTime,
    real: SystemTime,
}

fn scale(duration: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

fn shift(base: SystemTime, from: SystemTime, to: SystemTime, factor: f64) -> SystemTime {
    match to.duration_since(from) {
        Ok(ahead) => base.checked_add(scale(ahead, factor)).unwrap_or(base),
        Err(behind) => base
            .checked_sub(scale(behind.duration(), factor))
            .unwrap_or(base),
    }
}

impl TimeShifter {
    /// Non-finite or non-positive factors replay at captured speed.
    pub fn new(speedup_factor: f64) -> Self {
        let speedup_factor = if speedup_factor.is_finite() && speedup_factor > 0.0 {
            speedup_factor
        } else {
            tracing::warn!(speedup_factor, "invalid speedup factor, replaying at 1.0");
            1.0
        };
        Self {
            anchor: OnceLock::new(),
            speedup_factor,
        }
    }

    pub fn speedup_factor(&self) -> f64 {
        self.speedup_factor
    }

    /// Pins `source` to the current wall clock. Only the first call has an effect.
    pub fn set_first_timestamp(&self, source: SystemTime) -> bool {
        self.set_first_timestamp_at(source, SystemTime::now())
    }

    pub fn set_first_timestamp_at(&self, source: SystemTime, real: SystemTime) -> bool {
        let mut pinned = false;
        self.anchor.get_or_init(|| {
            pinned = true;
            tracing::info!(source = ?source, real = ?real, "replay time anchored");
            Anchor { source, real }
        });
        pinned
    }

    pub fn is_anchored(&self) -> bool {
        self.anchor.get().is_some()
    }

    pub fn transform_source_time_to_real_time(&self, source: SystemTime) -> Option<SystemTime> {
        let anchor = self.anchor.get()?;
        Some(shift(anchor.real, anchor.source, source, 1.0 / self.speedup_factor))
    }

    pub fn transform_real_time_to_source_time(&self, real: SystemTime) -> Option<SystemTime> {
        let anchor = self.anchor.get()?;
        Some(shift(anchor.source, anchor.real, real, self.speedup_factor))
    }
}

use std::{fmt::Display, time::Duration};

pub mod config;
pub mod robot;
pub mod telemetry;

pub use telemetry::{now_ms, TelemetrySample};

/// Keeps track of loop cycle durations and incrementally updates the values. In milliseconds.
pub struct CycleStats {
    mean: f64,
    var_sum: f64,
    std: f64,
    sample_count: usize,
    min: f64,
    max: f64,
    overruns: usize,
}

impl Default for CycleStats {
    fn default() -> Self {
        Self {
            mean: 0.0,
            var_sum: 0.0,
            std: 0.0,
            sample_count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            overruns: 0,
        }
    }
}

impl CycleStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one cycle that took `duration` out of a budget of `period`.
    pub fn update(&mut self, duration: Duration, period: Duration) {
        let msecs = duration.as_secs_f64() * 1000.0;

        self.sample_count += 1;

        // Welford's online mean / variance
        let old_mean = self.mean;
        self.mean += (msecs - self.mean) / self.sample_count as f64;
        self.var_sum += (msecs - old_mean) * (msecs - self.mean);
        self.std = (self.var_sum / self.sample_count as f64).sqrt();

        self.min = self.min.min(msecs);
        self.max = self.max.max(msecs);

        if duration > period {
            self.overruns += 1;
        }
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn cycles(&self) -> usize {
        self.sample_count
    }

    pub fn overruns(&self) -> usize {
        self.overruns
    }
}

impl Display for CycleStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.sample_count == 0 {
            return write!(f, "no cycles");
        }
        write!(
            f,
            "{:.2}±{:.2}ms, [{:.2}, {:.2}], {} cycles, {} overruns",
            self.mean, self.std, self.min, self.max, self.sample_count, self.overruns
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cycle_stats() {
        let period = Duration::from_millis(10);
        let mut stats = CycleStats::new();
        assert_eq!(stats.to_string(), "no cycles");

        stats.update(Duration::from_millis(2), period);
        stats.update(Duration::from_millis(4), period);
        stats.update(Duration::from_millis(12), period);

        assert_eq!(stats.cycles(), 3);
        assert_eq!(stats.overruns(), 1);
        assert_relative_eq!(stats.mean(), 6.0, epsilon = 1e-9);
        assert_relative_eq!(stats.std, (56.0f64 / 3.0).sqrt(), epsilon = 1e-9);
        assert_relative_eq!(stats.min, 2.0);
        assert_relative_eq!(stats.max, 12.0);
    }
}

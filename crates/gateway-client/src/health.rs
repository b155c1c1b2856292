use std::collections::VecDeque;
use std::time::Duration;

const MAX_LATENCY_SAMPLES: usize = 10;
const MIN_SAMPLES_FOR_QUALITY: usize = 3;

/// Coarse link quality derived from request round trips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    #[default]
    Unknown,
}

impl ConnectionQuality {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthMetrics {
    latencies: VecDeque<Duration>,
    successes: u32,
    failures: u32,
}

impl HealthMetrics {
    pub fn record_latency(&mut self, latency: Duration) {
        if self.latencies.len() == MAX_LATENCY_SAMPLES {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
        self.successes = self.successes.saturating_add(1);
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[must_use]
    pub fn average_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().sum();
        let samples = u32::try_from(self.latencies.len()).unwrap_or(u32::MAX);
        Some(total / samples)
    }

    #[must_use]
    pub fn quality(&self) -> ConnectionQuality {
        if self.latencies.len() < MIN_SAMPLES_FOR_QUALITY {
            return ConnectionQuality::Unknown;
        }
        let Some(average) = self.average_latency() else {
            return ConnectionQuality::Unknown;
        };
        let total = self.successes + self.failures;
        let failure_rate = if total == 0 {
            0.0
        } else {
            f64::from(self.failures) / f64::from(total)
        };
        let average_ms = average.as_millis();

        if average_ms < 100 && failure_rate < 0.05 {
            ConnectionQuality::Excellent
        } else if average_ms < 300 && failure_rate < 0.10 {
            ConnectionQuality::Good
        } else if average_ms < 1_000 && failure_rate < 0.25 {
            ConnectionQuality::Fair
        } else {
            ConnectionQuality::Poor
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(latencies_ms: &[u64], failures: u32) -> HealthMetrics {
        let mut metrics = HealthMetrics::default();
        for latency in latencies_ms {
            metrics.record_latency(Duration::from_millis(*latency));
        }
        for _ in 0..failures {
            metrics.record_failure();
        }
        metrics
    }

    #[test]
    fn quality_needs_enough_samples() {
        assert_eq!(metrics(&[10, 10], 0).quality(), ConnectionQuality::Unknown);
    }

    #[test]
    fn quality_tracks_latency_and_failures() {
        assert_eq!(
            metrics(&[20, 40, 60], 0).quality(),
            ConnectionQuality::Excellent
        );
        assert_eq!(
            metrics(&[200, 250, 150], 0).quality(),
            ConnectionQuality::Good
        );
        assert_eq!(
            metrics(&[20, 40, 60, 20, 20], 1).quality(),
            ConnectionQuality::Fair
        );
        assert_eq!(
            metrics(&[1_500, 1_200, 2_000], 0).quality(),
            ConnectionQuality::Poor
        );
    }

    #[test]
    fn keeps_only_recent_samples() {
        let mut metrics = metrics(&[5_000; 10], 0);
        for _ in 0..MAX_LATENCY_SAMPLES {
            metrics.record_latency(Duration::from_millis(10));
        }
        assert_eq!(metrics.average_latency(), Some(Duration::from_millis(10)));
    }
}

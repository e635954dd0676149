//! Bounded latency window.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

/// Most recent latency samples, oldest evicted first.
#[derive(Debug)]
pub struct LatencyWindow {
    capacity: usize,
    samples: VecDeque<Duration>,
}

impl LatencyWindow {
    /// Window holding at most `capacity` samples.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Add a sample.
    pub fn record(&mut self, sample: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Summary over the current window.
    #[must_use]
    pub fn summary(&self) -> LatencySummary {
        if self.samples.is_empty() {
            return LatencySummary::default();
        }

        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let total: Duration = sorted.iter().sum();
        #[allow(clippy::cast_possible_truncation)]
        let avg = total / sorted.len() as u32;
        let p95_index = (sorted.len() * 95).div_ceil(100).saturating_sub(1);

        LatencySummary {
            samples: sorted.len(),
            avg_ms: millis(avg),
            p95_ms: millis(sorted[p95_index]),
            max_ms: millis(sorted[sorted.len() - 1]),
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Latency summary in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    /// Samples in the window.
    pub samples: usize,
    /// Mean.
    pub avg_ms: f64,
    /// 95th percentile.
    pub p95_ms: f64,
    /// Maximum.
    pub max_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_summary_is_zero() {
        assert_eq!(LatencyWindow::new(10).summary(), LatencySummary::default());
    }

    #[test]
    fn summary_over_window() {
        let mut window = LatencyWindow::new(100);
        for ms in 1..=100 {
            window.record(Duration::from_millis(ms));
        }
        let summary = window.summary();

        assert_eq!(summary.samples, 100);
        assert!((summary.avg_ms - 50.5).abs() < 1e-6);
        assert!((summary.p95_ms - 95.0).abs() < 1e-6);
        assert!((summary.max_ms - 100.0).abs() < 1e-6);
    }

    #[test]
    fn evicts_oldest_sample() {
        let mut window = LatencyWindow::new(2);
        window.record(Duration::from_millis(500));
        window.record(Duration::from_millis(1));
        window.record(Duration::from_millis(2));

        let summary = window.summary();
        assert_eq!(summary.samples, 2);
        assert!((summary.max_ms - 2.0).abs() < 1e-6);
    }
}

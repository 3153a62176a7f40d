// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use medians::Medianf64;
use rolling_stats;
use statistical;

/// Summary statistics over a set of duration samples, in seconds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DescriptiveStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,

    // Omitted for session stats, which are accumulated without retaining
    // samples.
    pub median: Option<f64>,
    pub median_absolute_deviation: Option<f64>,
}

/// Tracks how long pipeline steps take: a bounded window of recent samples
/// (full descriptive stats) plus running whole-session stats. Used for the
/// per-cycle camera and solve timings surfaced in the observing log and
/// telemetry.
pub struct LatencyTracker {
    // Ring buffer of recent samples, seconds. We keep a plain Vec because we
    // want all elements as one slice and don't care about their order.
    window: Vec<f64>,
    next: usize,
    capacity: usize,

    session: rolling_stats::Stats<f64>,
}

impl LatencyTracker {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        LatencyTracker {
            window: Vec::with_capacity(capacity),
            next: 0,
            capacity,
            session: rolling_stats::Stats::<f64>::new(),
        }
    }

    pub fn record(&mut self, sample: Duration) {
        self.record_secs(sample.as_secs_f64());
    }

    pub fn record_secs(&mut self, secs: f64) {
        if self.window.len() < self.capacity {
            self.window.push(secs);
        } else {
            self.window[self.next] = secs;
            self.next = (self.next + 1) % self.capacity;
        }
        self.session.update(secs);
    }

    /// Stats over the recent window. None until the first sample arrives.
    pub fn recent(&self) -> Option<DescriptiveStats> {
        if self.window.is_empty() {
            return None;
        }
        let samples = self.window.as_slice();
        let mean = statistical::mean(samples);
        let stddev = if samples.len() > 1 {
            statistical::standard_deviation(samples, Some(mean))
        } else {
            0.0
        };
        let median = samples.medf_unchecked();
        Some(DescriptiveStats {
            min: *samples.iter().min_by(|a, b| a.total_cmp(b)).unwrap(),
            max: *samples.iter().max_by(|a, b| a.total_cmp(b)).unwrap(),
            mean,
            stddev,
            median: Some(median),
            median_absolute_deviation: Some(samples.madf(median)),
        })
    }

    /// Running stats since construction or the last `reset_session()`.
    pub fn session(&self) -> DescriptiveStats {
        DescriptiveStats {
            min: self.session.min,
            max: self.session.max,
            mean: self.session.mean,
            stddev: self.session.std_dev,
            median: None,
            median_absolute_deviation: None,
        }
    }

    /// Clears the session stats; the recent window is unaffected.
    pub fn reset_session(&mut self) {
        self.session = rolling_stats::Stats::<f64>::new();
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use super::*;

    #[test]
    fn test_empty_tracker() {
        let tracker = LatencyTracker::new(3);
        assert!(tracker.recent().is_none());
    }

    #[test]
    fn test_recent_and_session_stats() {
        let mut tracker = LatencyTracker::new(3);
        tracker.record(Duration::from_secs_f64(1.5));
        tracker.record(Duration::from_secs_f64(3.5));

        let recent = tracker.recent().unwrap();
        assert_eq!(recent.min, 1.5);
        assert_eq!(recent.max, 3.5);
        assert_eq!(recent.mean, 2.5);
        assert_abs_diff_eq!(recent.stddev, 1.41, epsilon = 0.01);
        assert_eq!(recent.median, Some(2.5));
        assert_eq!(recent.median_absolute_deviation, Some(1.0));

        let session = tracker.session();
        assert_eq!(session.min, 1.5);
        assert_eq!(session.max, 3.5);
        assert_eq!(session.mean, 2.5);
        assert_eq!(session.median, None);
    }

    #[test]
    fn test_window_wraps() {
        let mut tracker = LatencyTracker::new(3);
        for secs in [4.0, 5.0, 6.0, 7.0] {
            tracker.record_secs(secs);
        }
        // Oldest sample (4.0) has been overwritten.
        let recent = tracker.recent().unwrap();
        assert_eq!(recent.min, 5.0);
        assert_eq!(recent.max, 7.0);
        // Session stats still cover all four samples.
        assert_eq!(tracker.session().min, 4.0);
    }

    #[test]
    fn test_reset_session_keeps_window() {
        let mut tracker = LatencyTracker::new(3);
        tracker.record_secs(2.0);
        tracker.reset_session();
        assert!(tracker.recent().is_some());
        tracker.record_secs(4.0);
        assert_eq!(tracker.session().min, 4.0);
    }
}  // mod tests.

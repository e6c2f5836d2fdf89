//! Arrival-rate estimation for one topic.
//!
//! Keeps the last `capacity` arrival instants and derives the rate as
//! `(n - 1) / (t_last - t_first)`. Bounded by count, not by time, so a
//! topic that goes quiet keeps reporting its last known rate.

use std::collections::VecDeque;
use std::time::Instant;

/// Count-bounded arrival-rate estimator.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    arrivals: VecDeque<Instant>,
    capacity: usize,
    rate_hz: f64,
}

impl RateEstimator {
    /// Window of the last 20 arrivals.
    pub const DEFAULT_WINDOW: usize = 20;

    pub fn new() -> Self {
        Self::with_window(Self::DEFAULT_WINDOW)
    }

    /// A window of `capacity` arrivals; at least two are needed for a
    /// rate, so smaller values are raised to 2.
    pub fn with_window(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            arrivals: VecDeque::with_capacity(capacity),
            capacity,
            rate_hz: 0.0,
        }
    }

    /// Record an arrival at `when`.
    pub fn record_at(&mut self, when: Instant) {
        if self.arrivals.len() == self.capacity {
            self.arrivals.pop_front();
        }
        self.arrivals.push_back(when);
        self.rate_hz = self.compute();
    }

    /// Messages per second over the window; `0.0` until two distinct
    /// arrival times are known.
    pub fn rate_hz(&self) -> f64 {
        self.rate_hz
    }

    fn compute(&self) -> f64 {
        let (Some(first), Some(last)) = (self.arrivals.front(), self.arrivals.back()) else {
            return 0.0;
        };
        let span = last.saturating_duration_since(*first).as_secs_f64();
        if self.arrivals.len() < 2 || span <= 0.0 {
            return 0.0;
        }
        (self.arrivals.len() - 1) as f64 / span
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_and_single_are_zero() {
        let mut est = RateEstimator::new();
        assert_eq!(est.rate_hz(), 0.0);
        est.record_at(Instant::now());
        assert_eq!(est.rate_hz(), 0.0);
    }

    #[test]
    fn identical_timestamps_are_zero() {
        let mut est = RateEstimator::new();
        let t0 = Instant::now();
        est.record_at(t0);
        est.record_at(t0);
        assert_eq!(est.rate_hz(), 0.0);
    }

    #[test]
    fn one_per_second() {
        let mut est = RateEstimator::new();
        let t0 = Instant::now();
        for i in 0..5 {
            est.record_at(t0 + Duration::from_secs(i));
        }
        assert!((est.rate_hz() - 1.0).abs() < 1e-9, "rate = {}", est.rate_hz());
    }

    #[test]
    fn window_forgets_old_arrivals() {
        let mut est = RateEstimator::with_window(3);
        let t0 = Instant::now();
        // Slow start, then 10 Hz.
        est.record_at(t0);
        est.record_at(t0 + Duration::from_secs(10));
        est.record_at(t0 + Duration::from_millis(10_100));
        est.record_at(t0 + Duration::from_millis(10_200));
        assert!((est.rate_hz() - 10.0).abs() < 1e-6, "rate = {}", est.rate_hz());
    }

    #[test]
    fn tiny_window_is_raised_to_two() {
        let mut est = RateEstimator::with_window(1);
        let t0 = Instant::now();
        est.record_at(t0);
        est.record_at(t0 + Duration::from_millis(500));
        assert!((est.rate_hz() - 2.0).abs() < 1e-9);
        est.record_at(t0 + Duration::from_millis(600));
        assert!((est.rate_hz() - 10.0).abs() < 1e-9);
    }
}

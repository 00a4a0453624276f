//! Sliding per-period call window.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Timestamps of recent calls, pruned to the last `period`.
#[derive(Debug, Clone)]
pub struct RateWindow {
    timestamps: VecDeque<Instant>,
    max_count: usize,
    period: Duration,
    cap: usize,
}

impl RateWindow {
    /// The admission cap is `floor(max_count * safety_margin)`, but never
    /// below one call for a non-zero `max_count`.
    pub fn new(max_count: usize, period: Duration, safety_margin: f64) -> Self {
        let cap = if max_count == 0 {
            0
        } else {
            ((max_count as f64 * safety_margin).floor() as usize).clamp(1, max_count)
        };
        Self {
            timestamps: VecDeque::with_capacity(cap),
            max_count,
            period,
            cap,
        }
    }

    /// Drop timestamps older than `period`.
    pub fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) >= self.period {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Assumes `prune` ran at `now`.
    pub fn has_capacity(&self) -> bool {
        self.timestamps.len() < self.cap
    }

    /// Usage as a fraction of the nominal `max_count`.
    pub fn utilization(&self) -> f64 {
        if self.max_count == 0 {
            return 1.0;
        }
        self.timestamps.len() as f64 / self.max_count as f64
    }

    /// How long until one more call fits. Assumes `prune` ran at `now`.
    pub fn retry_after(&self, now: Instant) -> Duration {
        if self.has_capacity() {
            return Duration::ZERO;
        }
        if self.cap == 0 {
            return self.period;
        }
        // Enough entries must expire to bring the length below the cap.
        let blocking = self.timestamps.len() - self.cap;
        self.timestamps
            .get(blocking)
            .map(|&t| (t + self.period).saturating_duration_since(now))
            .unwrap_or(self.period)
    }

    pub fn record(&mut self, now: Instant) {
        self.timestamps.push_back(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_applies_safety_margin() {
        assert_eq!(RateWindow::new(50, Duration::from_secs(60), 0.9).cap(), 45);
        assert_eq!(RateWindow::new(2, Duration::from_secs(1), 1.0).cap(), 2);
        // floor(1 * 0.9) would never admit anything
        assert_eq!(RateWindow::new(1, Duration::from_secs(1), 0.9).cap(), 1);
        assert_eq!(RateWindow::new(0, Duration::from_secs(1), 0.9).cap(), 0);
    }

    #[test]
    fn test_prune_and_capacity() {
        let start = Instant::now();
        let mut window = RateWindow::new(2, Duration::from_secs(1), 1.0);

        window.record(start);
        window.record(start + Duration::from_millis(200));
        window.prune(start + Duration::from_millis(500));
        assert!(!window.has_capacity());
        assert_eq!(
            window.retry_after(start + Duration::from_millis(500)),
            Duration::from_millis(500)
        );

        window.prune(start + Duration::from_secs(1));
        assert_eq!(window.len(), 1);
        assert!(window.has_capacity());
        assert_eq!(window.retry_after(start + Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn test_utilization_against_nominal_max() {
        let now = Instant::now();
        let mut window = RateWindow::new(10, Duration::from_secs(60), 0.9);
        for _ in 0..8 {
            window.record(now);
        }
        assert!((window.utilization() - 0.8).abs() < f64::EPSILON);
    }
}

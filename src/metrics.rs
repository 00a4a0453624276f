//! Per-item and per-wave timings for a run.
//!
//! A wave is the set of items dispatched together in one scheduling pass. It
//! is not an execution barrier; its duration runs from dispatch until its
//! last item finishes. Speedup is the sum of item durations divided by the
//! run's elapsed time.

use crate::dag::state::duration_serde;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Items dispatched together and how long they took as a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionWave {
    pub number: usize,
    pub items: Vec<String>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

/// Final metrics for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub waves: Vec<ExecutionWave>,
    /// Execution time of every dispatched item
    #[serde(default)]
    pub item_durations: BTreeMap<String, u64>,
    #[serde(with = "duration_serde")]
    pub elapsed: Duration,
    #[serde(with = "duration_serde")]
    pub total_item_time: Duration,
    pub speedup: f64,
    pub efficiency: f64,
    pub max_concurrency: usize,
    pub peak_concurrency: usize,
    pub retries: u64,
}

#[derive(Debug)]
struct WaveTracker {
    items: Vec<String>,
    started: Instant,
    remaining: usize,
    duration: Option<Duration>,
}

/// Collects timings while a run is in progress.
#[derive(Debug)]
pub struct MetricsCollector {
    max_concurrency: usize,
    started: Instant,
    waves: Vec<WaveTracker>,
    item_durations: BTreeMap<String, Duration>,
    in_flight: usize,
    peak: usize,
    retries: u64,
}

impl MetricsCollector {
    /// Start collecting; the run clock starts now.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            started: Instant::now(),
            waves: Vec::new(),
            item_durations: BTreeMap::new(),
            in_flight: 0,
            peak: 0,
            retries: 0,
        }
    }

    /// Record a dispatch batch and return its wave number.
    pub fn begin_wave(&mut self, items: Vec<String>) -> usize {
        let number = self.waves.len();
        self.in_flight += items.len();
        self.peak = self.peak.max(self.in_flight);
        self.waves.push(WaveTracker {
            remaining: items.len(),
            items,
            started: Instant::now(),
            duration: None,
        });
        number
    }

    /// Record one finished item of `wave`.
    pub fn item_finished(&mut self, id: &str, wave: usize, duration: Duration) {
        self.item_durations.insert(id.to_string(), duration);
        self.in_flight = self.in_flight.saturating_sub(1);

        if let Some(tracker) = self.waves.get_mut(wave) {
            tracker.remaining = tracker.remaining.saturating_sub(1);
            if tracker.remaining == 0 && tracker.duration.is_none() {
                tracker.duration = Some(tracker.started.elapsed());
            }
        }
    }

    /// Count retries spent on one item.
    pub fn record_retries(&mut self, retries: u64) {
        self.retries += retries;
    }

    pub fn wave_count(&self) -> usize {
        self.waves.len()
    }

    /// Close the collector and derive speedup and efficiency.
    pub fn finish(self) -> RunMetrics {
        let elapsed = self.started.elapsed();
        let total_item_time: Duration = self.item_durations.values().sum();

        let speedup = if elapsed.is_zero() {
            0.0
        } else {
            total_item_time.as_secs_f64() / elapsed.as_secs_f64()
        };
        let efficiency = speedup / self.max_concurrency as f64;

        let waves: Vec<ExecutionWave> = self
            .waves
            .into_iter()
            .enumerate()
            .map(|(number, tracker)| ExecutionWave {
                number,
                duration: tracker
                    .duration
                    .unwrap_or_else(|| tracker.started.elapsed()),
                items: tracker.items,
            })
            .collect();

        info!(
            waves = waves.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            speedup,
            efficiency,
            "Run metrics"
        );

        RunMetrics {
            waves,
            item_durations: self
                .item_durations
                .into_iter()
                .map(|(id, d)| (id, d.as_millis() as u64))
                .collect(),
            elapsed,
            total_item_time,
            speedup,
            efficiency,
            max_concurrency: self.max_concurrency,
            peak_concurrency: self.peak,
            retries: self.retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_parallel_items_yield_speedup() {
        let mut metrics = MetricsCollector::new(4);
        let wave = metrics.begin_wave(vec!["a".into(), "b".into()]);

        tokio::time::advance(Duration::from_secs(1)).await;
        metrics.item_finished("a", wave, Duration::from_secs(1));
        metrics.item_finished("b", wave, Duration::from_secs(1));

        let result = metrics.finish();
        assert_eq!(result.waves.len(), 1);
        assert_eq!(result.waves[0].duration, Duration::from_secs(1));
        assert_eq!(result.total_item_time, Duration::from_secs(2));
        assert!((result.speedup - 2.0).abs() < 1e-9);
        assert!((result.efficiency - 0.5).abs() < 1e-9);
        assert_eq!(result.peak_concurrency, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wave_duration_ends_with_last_item() {
        let mut metrics = MetricsCollector::new(2);
        let first = metrics.begin_wave(vec!["a".into(), "b".into()]);

        tokio::time::advance(Duration::from_millis(100)).await;
        metrics.item_finished("a", first, Duration::from_millis(100));
        let second = metrics.begin_wave(vec!["c".into()]);

        tokio::time::advance(Duration::from_millis(200)).await;
        metrics.item_finished("b", first, Duration::from_millis(300));
        metrics.item_finished("c", second, Duration::from_millis(200));
        metrics.record_retries(1);

        let result = metrics.finish();
        assert_eq!(result.waves[0].duration, Duration::from_millis(300));
        assert_eq!(result.waves[1].duration, Duration::from_millis(200));
        assert_eq!(result.waves[1].items, vec!["c"]);
        assert_eq!(result.retries, 1);
        assert_eq!(result.item_durations["b"], 300);
    }

    #[test]
    fn test_empty_run_has_no_speedup() {
        let result = MetricsCollector::new(4).finish();
        assert!(result.waves.is_empty());
        assert_eq!(result.total_item_time, Duration::ZERO);
    }
}

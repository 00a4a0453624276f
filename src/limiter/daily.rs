//! Per-calendar-day call budget.

use chrono::{Days, NaiveDate};
use std::collections::BTreeMap;

/// Days kept before an entry is purged.
const RETENTION_DAYS: u64 = 2;

/// Call counts keyed by local date.
#[derive(Debug, Clone)]
pub struct DailyBudget {
    counts: BTreeMap<NaiveDate, u64>,
    max_per_day: u64,
    cap: u64,
}

impl DailyBudget {
    /// The cap is `floor(max_per_day * safety_margin)`, fixed at construction.
    pub fn new(max_per_day: u64, safety_margin: f64) -> Self {
        Self {
            counts: BTreeMap::new(),
            max_per_day,
            cap: (max_per_day as f64 * safety_margin).floor() as u64,
        }
    }

    pub fn cap(&self) -> u64 {
        self.cap
    }

    pub fn max_per_day(&self) -> u64 {
        self.max_per_day
    }

    /// Remove entries older than the retention window.
    pub fn purge(&mut self, today: NaiveDate) {
        let Some(cutoff) = today.checked_sub_days(Days::new(RETENTION_DAYS)) else {
            return;
        };
        self.counts.retain(|day, _| *day >= cutoff);
    }

    pub fn used(&self, today: NaiveDate) -> u64 {
        self.counts.get(&today).copied().unwrap_or(0)
    }

    pub fn has_capacity(&self, today: NaiveDate) -> bool {
        self.used(today) < self.cap
    }

    pub fn record(&mut self, today: NaiveDate) {
        *self.counts.entry(today).or_insert(0) += 1;
    }

    /// Number of days currently tracked.
    pub fn tracked_days(&self) -> usize {
        self.counts.len()
    }
}

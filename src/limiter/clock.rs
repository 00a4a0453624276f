//! Time sources for the limiter.

use chrono::{Local, NaiveDate};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic time plus the local calendar date.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
    fn today(&self) -> NaiveDate;
}

/// Wall clock. Uses tokio's `Instant`, so a paused tokio runtime pauses it too.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Hand-driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    state: Mutex<(Duration, NaiveDate)>,
}

impl ManualClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            base: Instant::now(),
            state: Mutex::new((Duration::ZERO, today)),
        }
    }

    /// Move monotonic time forward.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.0 += by;
    }

    /// Jump to another calendar date.
    pub fn set_date(&self, date: NaiveDate) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.1 = date;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.base + state.0
    }

    fn today(&self) -> NaiveDate {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let clock = ManualClock::new(date);
        let start = clock.now();

        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - start, Duration::from_secs(5));

        let next = date.succ_opt().unwrap();
        clock.set_date(next);
        assert_eq!(clock.today(), next);
    }
}

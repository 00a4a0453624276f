//! Dual-window rate limiter for the external generation service.
//!
//! Every call passes two gates:
//!
//! 1. **Sliding window** - at most `floor(per_minute * safety_margin)` calls
//!    in any rolling `period`. A full window is recoverable: the caller
//!    waits for the oldest call to age out.
//! 2. **Daily budget** - at most `floor(per_day * safety_margin)` calls per
//!    local calendar day. An exhausted day is not worth waiting for.
//!
//! Both gates share one lock, so a check followed by a record can be made
//! atomic with [`RateLimiter::try_acquire`]. The limiter is an ordinary value
//! meant to be created once per process and shared behind an `Arc`.

mod clock;
mod daily;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use daily::DailyBudget;
pub use window::RateWindow;

use crate::config::RateLimitConfig;
use crate::errors::RateLimitError;
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Point-in-time view of limiter usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LimiterUsage {
    pub window_used: usize,
    pub window_cap: usize,
    pub day_used: u64,
    pub day_cap: u64,
    /// Window at or above the warning threshold
    pub near_limit: bool,
    /// Admissions made while near the limit
    pub warnings: u64,
}

#[derive(Debug)]
struct LimiterState {
    window: RateWindow,
    daily: DailyBudget,
    warnings: u64,
}

/// Sliding-window plus daily-budget limiter.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
    clock: Arc<dyn Clock>,
    warning_threshold: f64,
}

impl RateLimiter {
    /// Create a limiter on the system clock.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a limiter on a caller-supplied clock.
    pub fn with_clock(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                window: RateWindow::new(config.per_minute, config.period(), config.safety_margin),
                daily: DailyBudget::new(config.per_day, config.safety_margin),
                warnings: 0,
            }),
            clock,
            warning_threshold: config.warning_threshold,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        // The guarded sections never panic midway; a poisoned lock still
        // holds consistent counters.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Prune, then check both gates. Daily exhaustion wins over a full window.
    fn check(
        &self,
        state: &mut LimiterState,
        now: Instant,
        today: NaiveDate,
    ) -> Result<(), RateLimitError> {
        state.window.prune(now);
        state.daily.purge(today);

        if !state.daily.has_capacity(today) {
            return Err(RateLimitError::DailyExhausted {
                used: state.daily.used(today),
                cap: state.daily.cap(),
            });
        }

        if !state.window.has_capacity() {
            return Err(RateLimitError::WindowFull {
                used: state.window.len(),
                cap: state.window.cap(),
                retry_after: state.window.retry_after(now),
            });
        }

        if state.window.utilization() >= self.warning_threshold {
            state.warnings += 1;
            warn!(
                used = state.window.len(),
                max = state.window.max_count(),
                "Rate window near limit"
            );
        }

        Ok(())
    }

    /// Check whether a call would be admitted right now.
    ///
    /// Only follow this with [`record`](Self::record) when no other caller can
    /// interleave; otherwise use [`try_acquire`](Self::try_acquire).
    pub fn can_admit(&self) -> Result<(), RateLimitError> {
        let mut state = self.lock();
        self.check(&mut state, self.clock.now(), self.clock.today())
    }

    /// Count one call against both gates.
    pub fn record(&self) {
        let mut state = self.lock();
        let now = self.clock.now();
        let today = self.clock.today();
        state.window.record(now);
        state.daily.record(today);
    }

    /// Check and record under one lock.
    pub fn try_acquire(&self) -> Result<(), RateLimitError> {
        let mut state = self.lock();
        let now = self.clock.now();
        let today = self.clock.today();
        self.check(&mut state, now, today)?;
        state.window.record(now);
        state.daily.record(today);
        Ok(())
    }

    /// Wait for window capacity, then record the call.
    ///
    /// Sleeps exactly until the blocking timestamp leaves the window. Returns
    /// immediately with `DailyExhausted` when the day is spent. Meant for
    /// clocks that follow tokio time, such as [`SystemClock`].
    pub async fn acquire(&self) -> Result<(), RateLimitError> {
        loop {
            match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(RateLimitError::WindowFull { retry_after, .. }) => {
                    let wait = retry_after.max(Duration::from_millis(1));
                    debug!(wait_ms = wait.as_millis() as u64, "Rate window full, waiting");
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Snapshot of current usage.
    pub fn usage(&self) -> LimiterUsage {
        let mut state = self.lock();
        let now = self.clock.now();
        let today = self.clock.today();
        state.window.prune(now);
        LimiterUsage {
            window_used: state.window.len(),
            window_cap: state.window.cap(),
            day_used: state.daily.used(today),
            day_cap: state.daily.cap(),
            near_limit: state.window.utilization() >= self.warning_threshold,
            warnings: state.warnings,
        }
    }
}

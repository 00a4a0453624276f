//! Retry coordinator for the external generation call.
//!
//! Each attempt first passes the shared [`RateLimiter`], then invokes the
//! call. Retryable failures (`RateLimited`, `Transient`) are retried with
//! exponential backoff plus random jitter; `Fatal` failures and an exhausted
//! daily budget end the sequence immediately.

use crate::config::RetryConfig;
use crate::errors::{CallError, RateLimitError, RetryError};
use crate::limiter::RateLimiter;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Passed to the retry hook before each backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryNotice {
    /// The attempt that just failed (1-based)
    pub attempt: u32,
    /// Sleep before the next attempt
    pub delay: Duration,
    pub error: CallError,
}

/// A successful call and how many attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySuccess<T> {
    pub value: T,
    pub attempts: u32,
}

/// Backoff schedule derived from [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: RetryConfig,
}

impl BackoffPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Total invocations allowed, first attempt included.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries.saturating_add(1)
    }

    /// `initial_delay * 2^failures`, capped at `max_delay`.
    ///
    /// `failures` is zero-based: the delay after the first failed attempt is
    /// the initial delay.
    pub fn base_delay(&self, failures: u32) -> Duration {
        let initial = self.config.initial_delay();
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        initial
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.config.max_delay())
    }

    /// Base delay plus up to `jitter_ratio` of itself.
    pub fn delay(&self, failures: u32) -> Duration {
        let base = self.base_delay(failures);
        let ratio = self.config.jitter_ratio;
        if ratio.is_nan() || ratio <= 0.0 || base.is_zero() {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=ratio.min(1.0));
        let extra =
            Duration::try_from_secs_f64(base.as_secs_f64() * jitter).unwrap_or(Duration::MAX);
        base.saturating_add(extra)
    }
}

/// Wraps the external call with quota admission and bounded retries.
#[derive(Debug, Clone)]
pub struct RetryCoordinator {
    policy: BackoffPolicy,
    limiter: Arc<RateLimiter>,
}

impl RetryCoordinator {
    pub fn new(config: RetryConfig, limiter: Arc<RateLimiter>) -> Self {
        Self {
            policy: BackoffPolicy::new(config),
            limiter,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Run `operation` until it succeeds, fails fatally, or runs out of
    /// attempts.
    ///
    /// `on_retry` fires once per scheduled retry, before the backoff sleep.
    /// Cancellation is observed while waiting on the limiter and during
    /// backoff, never in the middle of a call.
    pub async fn run<T, F, Fut, H>(
        &self,
        cancel: &CancellationToken,
        mut on_retry: H,
        mut operation: F,
    ) -> Result<RetrySuccess<T>, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
        H: FnMut(&RetryNotice),
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0u32;

        loop {
            self.admit(cancel, attempt).await?;
            attempt += 1;

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Call succeeded after retry");
                    }
                    return Ok(RetrySuccess {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                warn!(attempt, error = %error, "Non-retryable failure");
                return Err(RetryError::Fatal {
                    attempt,
                    cause: error,
                });
            }

            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %error, "Retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    cause: error,
                });
            }

            let delay = self.policy.delay(attempt - 1);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after delay"
            );
            on_retry(&RetryNotice {
                attempt,
                delay,
                error,
            });

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn admit(&self, cancel: &CancellationToken, attempts: u32) -> Result<(), RetryError> {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts });
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(RetryError::Cancelled { attempts }),
            admitted = self.limiter.acquire() => admitted.map_err(|err: RateLimitError| {
                warn!(error = %err, "Quota refused the call");
                RetryError::Quota(err)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn coordinator(config: RetryConfig) -> RetryCoordinator {
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::new(1000, 60)));
        RetryCoordinator::new(config, limiter)
    }

    fn fast() -> RetryConfig {
        RetryConfig::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter_ratio(0.0)
    }

    #[test]
    fn test_base_delay_doubles_and_caps() {
        let policy = BackoffPolicy::new(RetryConfig::default().with_jitter_ratio(0.0));
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(3), Duration::from_secs(8));
        assert_eq!(policy.base_delay(10), Duration::from_secs(30));
        assert_eq!(policy.base_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let policy = BackoffPolicy::new(RetryConfig::default());
        for failures in 0..4 {
            let base = policy.base_delay(failures);
            for _ in 0..50 {
                let delay = policy.delay(failures);
                assert!(delay >= base);
                assert!(delay <= base + base.mul_f64(0.3));
            }
        }
    }

    #[test]
    fn test_non_finite_jitter_does_not_panic() {
        let nan = BackoffPolicy::new(RetryConfig::default().with_jitter_ratio(f64::NAN));
        assert_eq!(nan.delay(0), Duration::from_secs(1));

        let huge = BackoffPolicy::new(RetryConfig::default().with_jitter_ratio(f64::INFINITY));
        for _ in 0..20 {
            let delay = huge.delay(1);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(4));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let retry = coordinator(fast());
        let calls = &AtomicU32::new(0);
        let mut notices = Vec::new();

        let result = retry
            .run(
                &CancellationToken::new(),
                |n: &RetryNotice| notices.push((n.attempt, n.delay)),
                move || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(CallError::Transient("timeout".into()))
                    } else {
                        Ok("done")
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(result.value, "done");
        assert_eq!(result.attempts, 3);
        assert_eq!(
            notices,
            vec![
                (1, Duration::from_millis(100)),
                (2, Duration::from_millis(200))
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let retry = coordinator(fast());
        let calls = &AtomicU32::new(0);

        let err = retry
            .run(&CancellationToken::new(), |_: &RetryNotice| {}, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CallError::Fatal("bad input".into()))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RetryError::Fatal { attempt: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts_and_cause() {
        let retry = coordinator(fast().with_max_retries(2));

        let err = retry
            .run(&CancellationToken::new(), |_: &RetryNotice| {}, || async {
                Err::<(), _>(CallError::RateLimited("429".into()))
            })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RetryError::Exhausted {
                attempts: 3,
                cause: CallError::RateLimited("429".into()),
            }
        );
        assert!(err.to_string().contains("3 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_quota_stops_without_calling() {
        let limiter = Arc::new(RateLimiter::new(
            &RateLimitConfig::new(100, 60).with_per_day(0),
        ));
        let retry = RetryCoordinator::new(fast(), limiter);
        let calls = &AtomicU32::new(0);

        let err = retry
            .run(&CancellationToken::new(), |_: &RetryNotice| {}, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RetryError::Quota(RateLimitError::DailyExhausted { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let retry = coordinator(fast().with_initial_delay(Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let err = retry
            .run(
                &cancel,
                move |_: &RetryNotice| trigger.cancel(),
                || async { Err::<(), _>(CallError::Transient("flaky".into())) },
            )
            .await
            .unwrap_err();

        assert_eq!(err, RetryError::Cancelled { attempts: 1 });
    }
}

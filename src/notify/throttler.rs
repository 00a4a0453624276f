//! Per-project batching and rate limiting of progress events.
//!
//! Progress events are monotonic snapshots, so a flush publishes only the
//! newest pending event and discards the rest. A batch flushes when it
//! reaches `max_batch_size` or when `batch_window` has passed since the last
//! flush. Each project's batch sits behind its own lock, so projects never
//! contend with each other.

use crate::config::NotificationConfig;
use crate::errors::PublishError;
use crate::notify::event::ProgressEvent;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The transport step of a flush.
pub trait Publisher: Send + Sync {
    fn publish(&self, project_id: &str, payload: &str) -> Result<(), PublishError>;
}

impl<F> Publisher for F
where
    F: Fn(&str, &str) -> Result<(), PublishError> + Send + Sync,
{
    fn publish(&self, project_id: &str, payload: &str) -> Result<(), PublishError> {
        self(project_id, payload)
    }
}

/// Called with the project and the undelivered event when a publish fails.
pub type FallbackHook = Arc<dyn Fn(&str, &ProgressEvent) + Send + Sync>;

/// Per-project counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThrottleStats {
    pub received: u64,
    pub published: u64,
    /// Events accepted into the batch but refused an immediate flush
    pub throttled: u64,
    /// Older events discarded in favour of a newer snapshot
    pub superseded: u64,
    pub publish_failures: u64,
}

impl ThrottleStats {
    fn merge(&mut self, other: &ThrottleStats) {
        self.received += other.received;
        self.published += other.published;
        self.throttled += other.throttled;
        self.superseded += other.superseded;
        self.publish_failures += other.publish_failures;
    }
}

#[derive(Debug)]
struct NotificationBatch {
    pending: Vec<ProgressEvent>,
    last_flush: Option<Instant>,
    last_activity: Instant,
    stats: ThrottleStats,
}

impl NotificationBatch {
    fn new(now: Instant) -> Self {
        Self {
            pending: Vec::new(),
            last_flush: None,
            last_activity: now,
            stats: ThrottleStats::default(),
        }
    }
}

type SharedBatch = Arc<Mutex<NotificationBatch>>;

/// Batches, throttles and publishes progress events per project.
pub struct NotificationThrottler {
    config: NotificationConfig,
    batches: RwLock<HashMap<String, SharedBatch>>,
    publisher: Arc<dyn Publisher>,
    fallback: Option<FallbackHook>,
}

impl std::fmt::Debug for NotificationThrottler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationThrottler")
            .field("config", &self.config)
            .field("projects", &self.project_count())
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

fn lock_batch(batch: &SharedBatch) -> MutexGuard<'_, NotificationBatch> {
    batch.lock().unwrap_or_else(|e| e.into_inner())
}

impl NotificationThrottler {
    pub fn new(config: NotificationConfig, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            config,
            batches: RwLock::new(HashMap::new()),
            publisher,
            fallback: None,
        }
    }

    /// Install the hook invoked when the transport refuses a flush.
    pub fn with_fallback(mut self, hook: FallbackHook) -> Self {
        self.fallback = Some(hook);
        self
    }

    pub fn config(&self) -> &NotificationConfig {
        &self.config
    }

    fn batch(&self, project_id: &str) -> SharedBatch {
        {
            let batches = self.batches.read().unwrap_or_else(|e| e.into_inner());
            if let Some(batch) = batches.get(project_id) {
                return batch.clone();
            }
        }
        let mut batches = self.batches.write().unwrap_or_else(|e| e.into_inner());
        batches
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(NotificationBatch::new(Instant::now()))))
            .clone()
    }

    fn snapshot(&self) -> Vec<(String, SharedBatch)> {
        let batches = self.batches.read().unwrap_or_else(|e| e.into_inner());
        batches
            .iter()
            .map(|(project, batch)| (project.clone(), batch.clone()))
            .collect()
    }

    /// Queue an event for its project.
    ///
    /// Returns `false` when the event was throttled: a batch is already
    /// pending and the last flush was less than `1 / max_rate_per_project`
    /// ago. Throttled events stay queued and may still be published later
    /// as the newest snapshot. At most `max_batch_size` events are kept; the
    /// oldest are dropped first.
    pub fn add_notification(&self, project_id: &str, event: ProgressEvent) -> bool {
        let batch = self.batch(project_id);
        let mut batch = lock_batch(&batch);
        let now = Instant::now();

        batch.stats.received += 1;
        batch.last_activity = now;

        let throttled = match batch.last_flush {
            Some(last) => {
                now.duration_since(last) < self.config.min_publish_interval()
                    && !batch.pending.is_empty()
            }
            None => false,
        };

        batch.pending.push(event);
        let cap = self.config.max_batch_size.max(1);
        if batch.pending.len() > cap {
            let excess = batch.pending.len() - cap;
            batch.pending.drain(..excess);
            batch.stats.superseded += excess as u64;
        }

        if throttled {
            batch.stats.throttled += 1;
            return false;
        }

        let size_reached = batch.pending.len() >= cap;
        let window_elapsed = batch
            .last_flush
            .is_none_or(|last| now.duration_since(last) >= self.config.batch_window());

        if size_reached || window_elapsed {
            self.flush_locked(project_id, &mut batch, now);
        }
        true
    }

    /// Publish the newest pending event. On failure only that event stays
    /// queued and the older ones count as superseded.
    fn flush_locked(&self, project_id: &str, batch: &mut NotificationBatch, now: Instant) -> bool {
        let Some(latest) = batch.pending.last() else {
            return false;
        };

        let result = latest
            .to_json()
            .map_err(|e| PublishError::Encode(e.to_string()))
            .and_then(|payload| self.publisher.publish(project_id, &payload));

        match result {
            Ok(()) => {
                let superseded = batch.pending.len() as u64 - 1;
                batch.stats.published += 1;
                batch.stats.superseded += superseded;
                batch.pending.clear();
                batch.last_flush = Some(now);
                debug!(project = project_id, superseded, "Flushed notification batch");
                true
            }
            Err(err) => {
                batch.stats.publish_failures += 1;
                warn!(
                    project = project_id,
                    pending = batch.pending.len(),
                    error = %err,
                    "Publish failed, keeping latest event queued"
                );
                if let Some(hook) = &self.fallback {
                    hook(project_id, latest);
                }
                // Only the newest snapshot can ever be published.
                let stale = batch.pending.len() - 1;
                batch.pending.drain(..stale);
                batch.stats.superseded += stale as u64;
                false
            }
        }
    }

    /// Flush every non-empty batch whose window has elapsed. Returns the
    /// number of successful publishes.
    pub fn flush_due(&self) -> usize {
        let now = Instant::now();
        let window = self.config.batch_window();
        self.snapshot()
            .into_iter()
            .filter(|(project, batch)| {
                let mut batch = lock_batch(batch);
                let due = !batch.pending.is_empty()
                    && batch
                        .last_flush
                        .is_none_or(|last| now.duration_since(last) >= window);
                due && self.flush_locked(project, &mut batch, now)
            })
            .count()
    }

    /// Flush every non-empty batch regardless of timing.
    pub fn flush_all(&self) -> usize {
        let now = Instant::now();
        self.snapshot()
            .into_iter()
            .filter(|(project, batch)| {
                let mut batch = lock_batch(batch);
                self.flush_locked(project, &mut batch, now)
            })
            .count()
    }

    /// Discard empty batches idle for longer than the idle timeout.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let timeout = self.config.idle_timeout();
        let mut batches = self.batches.write().unwrap_or_else(|e| e.into_inner());
        let before = batches.len();
        batches.retain(|project, batch| {
            let batch = lock_batch(batch);
            let idle = batch.pending.is_empty() && now.duration_since(batch.last_activity) >= timeout;
            if idle {
                debug!(project = project.as_str(), "Evicting idle notification batch");
            }
            !idle
        });
        before - batches.len()
    }

    pub fn pending(&self, project_id: &str) -> usize {
        let batches = self.batches.read().unwrap_or_else(|e| e.into_inner());
        batches
            .get(project_id)
            .map(|batch| lock_batch(batch).pending.len())
            .unwrap_or(0)
    }

    pub fn stats(&self, project_id: &str) -> Option<ThrottleStats> {
        let batches = self.batches.read().unwrap_or_else(|e| e.into_inner());
        batches.get(project_id).map(|batch| lock_batch(batch).stats)
    }

    /// Counters summed over every tracked project.
    pub fn total_stats(&self) -> ThrottleStats {
        let mut total = ThrottleStats::default();
        for (_, batch) in self.snapshot() {
            total.merge(&lock_batch(&batch).stats);
        }
        total
    }

    pub fn project_count(&self) -> usize {
        self.batches.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Run `flush_due` and `evict_idle` every batch window until cancelled,
    /// then flush whatever is left.
    pub fn spawn_flusher(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.batch_window().max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.flush_due();
                        self.evict_idle();
                    }
                }
            }
            self.flush_all();
        })
    }
}

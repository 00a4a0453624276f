//! DAG executor for parallel item execution under a shared quota.
//!
//! A single loop owns the [`DagScheduler`]. Each pass dispatches as much of
//! the ready set as the worker pool allows, then waits for the next worker
//! to finish and feeds its result straight back into the next pass. A failed
//! item fails its transitive dependents at once, without dispatching them.

use crate::catalog::{Catalog, WorkItem};
use crate::config::ExecutorConfig;
use crate::dag::resolver::{DependencyGraph, DependencyResolver, ResolveOptions};
use crate::dag::scheduler::DagScheduler;
use crate::dag::state::{
    duration_serde, ExecutionTimer, FailedItem, ItemResult, RunState, RunSummary,
};
use crate::errors::{CallError, CatalogError, NodeFailure, RetryError};
use crate::metrics::{MetricsCollector, RunMetrics};
use crate::notify::{EventStatus, NotificationThrottler, ProgressEvent};
use crate::retry::{RetryCoordinator, RetryNotice, RetrySuccess};
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The opaque external call made for each item.
#[async_trait]
pub trait ItemExecutor: Send + Sync {
    async fn execute(&self, item: &WorkItem) -> Result<String, CallError>;
}

/// Result of a run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: Uuid,
    pub project_id: String,
    pub state: RunState,
    /// True only if every item in the graph completed
    pub success: bool,
    pub summary: RunSummary,
    pub failures: Vec<FailedItem>,
    pub metrics: RunMetrics,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl ExecutionReport {
    /// Run-level status as reported to observers.
    pub fn status(&self) -> EventStatus {
        match self.state {
            RunState::Completed => EventStatus::Complete,
            RunState::Cancelled => EventStatus::Cancelled,
            _ => EventStatus::Failed,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Fans events out to the optional channel and the optional throttler.
#[derive(Clone)]
struct EventSink {
    project_id: Arc<str>,
    notifier: Option<Arc<NotificationThrottler>>,
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl EventSink {
    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // Never block the scheduling loop on a slow consumer.
            if let Err(err) = tx.try_send(event.clone()) {
                debug!(error = %err, "Dropping event for channel consumer");
            }
        }
        if let Some(notifier) = &self.notifier {
            notifier.add_notification(&self.project_id, event);
        }
    }

    fn status(&self, status: EventStatus) -> ProgressEvent {
        ProgressEvent::status(self.project_id.as_ref(), status)
    }
}

enum WorkerResult {
    Finished(Result<RetrySuccess<String>, RetryError>),
    Panicked(String),
}

struct WorkerOutcome {
    id: String,
    wave: usize,
    duration: Duration,
    result: WorkerResult,
}

/// One dispatched item: quota admission, retries and the call itself.
struct Worker {
    item: WorkItem,
    wave: usize,
    retry: RetryCoordinator,
    executor: Arc<dyn ItemExecutor>,
    cancel: CancellationToken,
    sink: EventSink,
}

impl Worker {
    async fn run(self, _permit: OwnedSemaphorePermit) -> WorkerOutcome {
        let started = Instant::now();
        let result = match AssertUnwindSafe(self.call()).catch_unwind().await {
            Ok(result) => WorkerResult::Finished(result),
            Err(payload) => WorkerResult::Panicked(panic_message(payload)),
        };
        WorkerOutcome {
            id: self.item.id.clone(),
            wave: self.wave,
            duration: started.elapsed(),
            result,
        }
    }

    async fn call(&self) -> Result<RetrySuccess<String>, RetryError> {
        let executor = self.executor.as_ref();
        let item = &self.item;
        let sink = &self.sink;

        self.retry
            .run(
                &self.cancel,
                |notice: &RetryNotice| {
                    sink.emit(
                        sink.status(EventStatus::Retrying)
                            .for_item(&item.id)
                            .with_message(format!(
                                "attempt {} failed ({}); retrying in {}ms",
                                notice.attempt,
                                notice.error,
                                notice.delay.as_millis()
                            )),
                    );
                },
                move || executor.execute(item),
            )
            .await
    }
}

/// A joined worker task.
enum Joined {
    Finished(WorkerOutcome),
    /// The task died outside the worker's own panic guard.
    Lost { id: String, failure: NodeFailure },
}

/// Worker tasks and the item each one runs.
struct WorkerPool {
    tasks: JoinSet<WorkerOutcome>,
    items: HashMap<TaskId, String>,
}

impl WorkerPool {
    fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            items: HashMap::new(),
        }
    }

    fn spawn<F>(&mut self, id: String, work: F)
    where
        F: Future<Output = WorkerOutcome> + Send + 'static,
    {
        let handle = self.tasks.spawn(work);
        self.items.insert(handle.id(), id);
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Next finished task. `None` once the pool is empty.
    async fn join_next(&mut self) -> Option<Joined> {
        loop {
            match self.tasks.join_next_with_id().await? {
                Ok((task, outcome)) => {
                    self.items.remove(&task);
                    return Some(Joined::Finished(outcome));
                }
                Err(err) => match self.items.remove(&err.id()) {
                    Some(id) => {
                        let failure = lost_failure(err);
                        return Some(Joined::Lost { id, failure });
                    }
                    None => warn!(error = %err, "Untracked worker task ended abnormally"),
                },
            }
        }
    }

    /// Abort and reap every task.
    async fn shutdown(&mut self) {
        self.tasks.shutdown().await;
        self.items.clear();
    }
}

fn lost_failure(err: JoinError) -> NodeFailure {
    if err.is_panic() {
        NodeFailure::Panicked {
            message: panic_message(err.into_panic()),
        }
    } else {
        NodeFailure::Unresolved
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return s.to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}

/// Mutable state of one run, owned by the scheduling loop.
struct RunContext {
    scheduler: DagScheduler,
    summary: RunSummary,
    metrics: MetricsCollector,
    sink: EventSink,
    total: usize,
}

impl RunContext {
    fn progress(&self, id: &str, status: EventStatus) {
        self.sink.emit(ProgressEvent::progress(
            self.sink.project_id.as_ref(),
            id,
            status,
            self.scheduler.completed_count(),
            self.total,
        ));
    }

    /// Apply a worker's result. Returns the quota message when the daily
    /// budget ran out.
    fn record_outcome(&mut self, outcome: WorkerOutcome) -> Option<String> {
        let WorkerOutcome {
            id,
            wave,
            duration,
            result,
        } = outcome;
        self.metrics.item_finished(&id, wave, duration);

        match result {
            WorkerResult::Finished(Ok(success)) => {
                self.metrics
                    .record_retries(u64::from(success.attempts.saturating_sub(1)));
                if let Err(err) = self.scheduler.mark_completed(&id, success.value.clone()) {
                    warn!(error = %err, "Ignoring completion");
                    return None;
                }
                info!(
                    item = %id,
                    attempts = success.attempts,
                    duration_ms = duration.as_millis() as u64,
                    "Item complete"
                );
                self.summary.add_result(ItemResult::success(
                    &id,
                    success.value,
                    success.attempts,
                    wave,
                    duration,
                ));
                self.progress(&id, EventStatus::Complete);
                None
            }
            WorkerResult::Finished(Err(err)) => {
                let attempts = err.attempts();
                self.metrics
                    .record_retries(u64::from(attempts.saturating_sub(1)));
                let failure = NodeFailure::from(err);
                let quota = match &failure {
                    NodeFailure::QuotaExhausted { message } => Some(message.clone()),
                    _ => None,
                };
                self.fail(&id, failure, attempts, Some(wave), duration);
                quota
            }
            WorkerResult::Panicked(message) => {
                self.fail(&id, NodeFailure::Panicked { message }, 1, Some(wave), duration);
                None
            }
        }
    }

    /// Feed one joined task back into the run. Returns the quota message
    /// when the daily budget ran out.
    fn record_joined(&mut self, joined: Joined) -> Option<String> {
        match joined {
            Joined::Finished(outcome) => self.record_outcome(outcome),
            Joined::Lost { id, failure } => {
                warn!(item = %id, failure = %failure, "Worker task ended abnormally");
                self.fail(&id, failure, 1, None, Duration::ZERO);
                None
            }
        }
    }

    /// Fail a dispatched node and cascade to its dependents.
    fn fail(
        &mut self,
        id: &str,
        failure: NodeFailure,
        attempts: u32,
        wave: Option<usize>,
        duration: Duration,
    ) {
        if let Err(err) = self.scheduler.mark_failed(id, failure.clone()) {
            warn!(error = %err, "Ignoring failure");
            return;
        }
        warn!(item = id, attempts, failure = %failure, "Item failed");
        self.summary
            .add_result(ItemResult::failure(id, failure, attempts, wave, duration));
        self.progress(id, EventStatus::Failed);
        self.cascade(id);
    }

    fn cascade(&mut self, id: &str) {
        let skipped = self.scheduler.cascade_failure(id);
        if skipped.is_empty() {
            return;
        }
        info!(item = id, dependents = ?skipped, "Skipping dependents of failed item");
        for dependent in skipped {
            let failure = self
                .scheduler
                .get_node(&dependent)
                .and_then(|n| n.failure().cloned())
                .unwrap_or(NodeFailure::Skipped {
                    failed_dependencies: vec![id.to_string()],
                });
            self.summary
                .add_result(ItemResult::not_dispatched(&dependent, failure));
            self.progress(&dependent, EventStatus::Skipped);
        }
    }

    /// Fail a pending node whose dependency failed earlier.
    fn skip(&mut self, id: &str, failed_dependencies: Vec<String>) {
        let failure = NodeFailure::Skipped {
            failed_dependencies,
        };
        if self.scheduler.mark_failed(id, failure.clone()).is_err() {
            return;
        }
        self.summary.add_result(ItemResult::not_dispatched(id, failure));
        self.progress(id, EventStatus::Skipped);
        self.cascade(id);
    }

    /// Fail every pending node without dispatching it.
    fn abandon(&mut self, failure: NodeFailure, status: EventStatus) {
        for id in self.scheduler.abandon_pending(failure.clone()) {
            self.summary
                .add_result(ItemResult::not_dispatched(&id, failure.clone()));
            self.progress(&id, status);
        }
    }

    /// Fail nodes left `Running` after their workers were aborted.
    fn fail_stragglers(&mut self) {
        let running: Vec<String> = self
            .scheduler
            .nodes()
            .iter()
            .filter(|n| n.state.is_running())
            .map(|n| n.id().to_string())
            .collect();
        for id in running {
            self.fail(&id, NodeFailure::Cancelled, 0, None, Duration::ZERO);
        }
    }
}

/// Runs a dependency graph on a bounded worker pool.
pub struct DagExecutor {
    config: ExecutorConfig,
    retry: RetryCoordinator,
    project_id: String,
    notifier: Option<Arc<NotificationThrottler>>,
    event_tx: Option<mpsc::Sender<ProgressEvent>>,
    cancel: CancellationToken,
}

impl DagExecutor {
    /// Create a new DAG executor.
    pub fn new(config: ExecutorConfig, retry: RetryCoordinator) -> Self {
        Self {
            config,
            retry,
            project_id: "default".to_string(),
            notifier: None,
            event_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Project whose channel receives this run's events.
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    /// Route events through a throttler.
    pub fn with_notifier(mut self, notifier: Arc<NotificationThrottler>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Copy every event, unthrottled, to a channel. Events are dropped
    /// rather than awaited when the channel is full.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<ProgressEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels the run when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn sink(&self) -> EventSink {
        EventSink {
            project_id: Arc::from(self.project_id.as_str()),
            notifier: self.notifier.clone(),
            tx: self.event_tx.clone(),
        }
    }

    /// Resolve `requested` (everything when empty) and execute it.
    pub async fn execute_catalog<S: AsRef<str>>(
        &self,
        catalog: &Catalog,
        requested: &[S],
        executor: Arc<dyn ItemExecutor>,
    ) -> Result<ExecutionReport, CatalogError> {
        let resolver = DependencyResolver::new(catalog).with_options(ResolveOptions {
            strict_dependencies: self.config.strict_dependencies,
        });
        let graph = if requested.is_empty() {
            resolver.resolve_all()?
        } else {
            resolver.resolve(requested)?
        };
        Ok(self.execute(graph, executor).await)
    }

    /// Execute every node of `graph`.
    pub async fn execute(
        &self,
        graph: DependencyGraph,
        executor: Arc<dyn ItemExecutor>,
    ) -> ExecutionReport {
        let run_id = Uuid::new_v4();
        let timer = ExecutionTimer::start();
        let total = graph.len();
        let max_concurrency = self.config.max_concurrency.max(1);

        info!(
            run_id = %run_id,
            project = %self.project_id,
            items = total,
            max_concurrency,
            "Starting run"
        );

        let mut ctx = RunContext {
            scheduler: DagScheduler::new(graph),
            summary: RunSummary::new(total),
            metrics: MetricsCollector::new(max_concurrency),
            sink: self.sink(),
            total,
        };
        ctx.sink
            .emit(ctx.sink.status(EventStatus::Started).with_counts(0, total));

        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let mut workers = WorkerPool::new();
        let mut cancelled = false;
        let mut quota_exhausted = false;

        loop {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            if !quota_exhausted {
                self.dispatch(&mut ctx, &semaphore, &mut workers, &executor);
            }

            if workers.is_empty() {
                if ctx.scheduler.all_complete() {
                    break;
                }

                let blocked = ctx.scheduler.blocked_by_failure();
                if !blocked.is_empty() {
                    for (id, failed) in blocked {
                        ctx.skip(&id, failed);
                    }
                    continue;
                }

                // Nothing running, nothing ready, nothing blocked by a failure.
                let pending: Vec<String> = ctx
                    .scheduler
                    .nodes()
                    .iter()
                    .filter(|n| n.state.is_pending())
                    .map(|n| n.id().to_string())
                    .collect();
                warn!(items = ?pending, "Scheduler stuck, reporting pending items as unresolved");
                ctx.abandon(NodeFailure::Unresolved, EventStatus::Failed);
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                joined = workers.join_next() => {
                    if let Some(message) = joined.and_then(|joined| ctx.record_joined(joined)) {
                        warn!("Daily quota exhausted, abandoning pending items");
                        quota_exhausted = true;
                        ctx.abandon(
                            NodeFailure::QuotaExhausted { message },
                            EventStatus::Failed,
                        );
                    }
                }
            }
        }

        if cancelled {
            info!(in_flight = workers.len(), "Run cancelled, abandoning pending items");
            ctx.abandon(NodeFailure::Cancelled, EventStatus::Cancelled);
            self.drain(&mut ctx, &mut workers).await;
        }
        ctx.fail_stragglers();

        let state = if cancelled {
            RunState::Cancelled
        } else if ctx.scheduler.all_success() {
            RunState::Completed
        } else {
            RunState::Failed
        };
        let success = state == RunState::Completed;

        ctx.summary.duration = timer.elapsed();
        let final_status = match state {
            RunState::Completed => EventStatus::Complete,
            RunState::Cancelled => EventStatus::Cancelled,
            _ => EventStatus::Failed,
        };
        ctx.sink.emit(
            ctx.sink
                .status(final_status)
                .with_counts(ctx.scheduler.completed_count(), total),
        );
        if let Some(notifier) = &self.notifier {
            notifier.flush_all();
        }

        let RunContext {
            summary, metrics, ..
        } = ctx;
        let failures = summary.failures();
        let metrics = metrics.finish();

        if success {
            info!(run_id = %run_id, completed = summary.completed, "Run complete");
        } else {
            warn!(
                run_id = %run_id,
                completed = summary.completed,
                failed = summary.failed,
                skipped = summary.skipped,
                state = ?state,
                "Run did not complete"
            );
        }

        ExecutionReport {
            run_id,
            project_id: self.project_id.clone(),
            state,
            success,
            summary,
            failures,
            metrics,
            duration: timer.elapsed(),
        }
    }

    /// Start as much of the ready set as there are free permits.
    fn dispatch(
        &self,
        ctx: &mut RunContext,
        semaphore: &Arc<Semaphore>,
        workers: &mut WorkerPool,
        executor: &Arc<dyn ItemExecutor>,
    ) {
        let mut batch = Vec::new();
        for id in ctx.scheduler.ready_ids() {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                break;
            };
            if let Err(err) = ctx.scheduler.mark_running(&id) {
                warn!(error = %err, "Skipping dispatch");
                continue;
            }
            batch.push((id, permit));
        }
        if batch.is_empty() {
            return;
        }

        let ids: Vec<String> = batch.iter().map(|(id, _)| id.clone()).collect();
        let wave = ctx.metrics.begin_wave(ids.clone());
        debug!(wave, items = ?ids, "Dispatching wave");
        ctx.sink.emit(
            ctx.sink
                .status(EventStatus::InProgress)
                .with_counts(ctx.scheduler.completed_count(), ctx.total)
                .with_message(format!("wave {wave}: {}", ids.join(", "))),
        );

        for (id, permit) in batch {
            let Some(item) = ctx.scheduler.get_node(&id).map(|n| n.item.clone()) else {
                continue;
            };
            ctx.progress(&id, EventStatus::Running);
            let worker = Worker {
                item,
                wave,
                retry: self.retry.clone(),
                executor: executor.clone(),
                cancel: self.cancel.clone(),
                sink: ctx.sink.clone(),
            };
            workers.spawn(id, worker.run(permit));
        }
    }

    /// Wait up to the shutdown timeout for in-flight workers, then abort.
    async fn drain(&self, ctx: &mut RunContext, workers: &mut WorkerPool) {
        let timeout = self.config.shutdown_timeout();
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = workers.join_next().await {
                ctx.record_joined(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                in_flight = workers.len(),
                timeout_secs = timeout.as_secs(),
                "Shutdown timeout reached, aborting in-flight items"
            );
            workers.shutdown().await;
        }
    }
}

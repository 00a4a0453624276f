//! Run execution: `docflow run`.
//!
//! Wires the configured limiter, retry coordinator, notification pipeline and
//! executor together and runs a catalog against [`SimulatedGenerator`], an
//! in-process stand-in for the external generation service.

use anyhow::{Context, Result};
use async_trait::async_trait;
use console::style;
use docflow::catalog::WorkItem;
use docflow::config::DocflowConfig;
use docflow::dag::{DagExecutor, ExecutionReport, ItemExecutor};
use docflow::errors::CallError;
use docflow::limiter::RateLimiter;
use docflow::notify::broadcast_pipeline;
use docflow::retry::RetryCoordinator;
use docflow::ui::{RunUi, UiMode, format_duration};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::plan::resolve_catalog;

/// Parsed `docflow run` arguments.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub catalog: PathBuf,
    pub ids: Vec<String>,
    pub project: String,
    pub delay: Duration,
    pub fail: Vec<String>,
    pub flaky: Vec<String>,
    pub ui: UiMode,
    pub print_report: bool,
}

/// Generator that sleeps, then succeeds, fails, or fails once transiently.
#[derive(Debug, Default)]
pub struct SimulatedGenerator {
    delay: Duration,
    fail: HashSet<String>,
    flaky: HashSet<String>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl SimulatedGenerator {
    pub fn new(delay: Duration, fail: &[String], flaky: &[String]) -> Self {
        Self {
            delay,
            fail: fail.iter().cloned().collect(),
            flaky: flaky.iter().cloned().collect(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn next_attempt(&self, id: &str) -> u32 {
        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = attempts.entry(id.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

#[async_trait]
impl ItemExecutor for SimulatedGenerator {
    async fn execute(&self, item: &WorkItem) -> Result<String, CallError> {
        let attempt = self.next_attempt(&item.id);
        tokio::time::sleep(self.delay).await;

        if self.fail.contains(&item.id) {
            return Err(CallError::Fatal(format!("generation of {} rejected", item.id)));
        }
        if self.flaky.contains(&item.id) && attempt == 1 {
            return Err(CallError::Transient(format!(
                "upstream timeout while generating {}",
                item.id
            )));
        }

        debug!(item = %item.id, attempt, "Simulated generation finished");
        Ok(format!("generated {} (attempt {})", item.id, attempt))
    }
}

/// Execute the run and render it. Returns whether the run completed.
pub async fn cmd_run(config: DocflowConfig, options: RunOptions) -> Result<bool> {
    config.check().context("Refusing to start run")?;
    let (_catalog, graph) = resolve_catalog(&config, &options.catalog, &options.ids)?;
    let total = graph.len();

    for id in options.fail.iter().chain(&options.flaky) {
        if graph.get_index(id).is_none() {
            warn!(item = %id, "Simulation flag names an item outside the plan");
        }
    }

    let limiter = Arc::new(RateLimiter::new(&config.limits));
    let retry = RetryCoordinator::new(config.retry.clone(), limiter.clone());
    let (throttler, broadcaster) = broadcast_pipeline(&config.notifications);
    let cancel = CancellationToken::new();

    let executor = DagExecutor::new(config.executor.clone(), retry)
        .with_project(options.project.clone())
        .with_notifier(throttler.clone())
        .with_cancellation(cancel.clone());

    let flusher_stop = CancellationToken::new();
    let flusher = throttler.clone().spawn_flusher(flusher_stop.clone());

    let subscription = broadcaster.subscribe(&options.project);
    let ui_done = CancellationToken::new();
    let ui_task = tokio::spawn({
        let done = ui_done.clone();
        let mode = options.ui;
        async move {
            let mut ui = RunUi::new(total, mode);
            ui.follow(subscription, done).await;
            ui.finish();
            ui.outcome()
        }
    });

    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        }
    });

    let generator = Arc::new(SimulatedGenerator::new(
        options.delay,
        &options.fail,
        &options.flaky,
    ));
    let report = executor.execute(graph, generator).await;
    interrupt.abort();

    flusher_stop.cancel();
    flusher.await.context("Notification flusher failed")?;
    ui_done.cancel();
    let rendered = ui_task.await.context("Progress renderer failed")?;
    debug!(outcome = ?rendered, "Progress renderer finished");

    let limits = limiter.usage();
    info!(
        window_used = limits.window_used,
        day_used = limits.day_used,
        day_cap = limits.day_cap,
        warnings = limits.warnings,
        "Quota usage after run"
    );

    if options.ui != UiMode::Json {
        print_summary(&report);
    }
    if options.print_report {
        println!("{}", report.to_json()?);
    }

    Ok(report.success)
}

fn print_summary(report: &ExecutionReport) {
    let summary = &report.summary;
    let status = if report.success {
        style(report.status().as_str()).green().bold()
    } else {
        style(report.status().as_str()).red().bold()
    };

    println!();
    println!(
        "Run {} {}: {}/{} completed, {} failed ({} skipped) in {}",
        style(report.run_id).dim(),
        status,
        summary.completed,
        summary.total_items,
        summary.failed,
        summary.skipped,
        format_duration(report.duration)
    );

    if !report.failures.is_empty() {
        println!("Failures:");
        for failed in &report.failures {
            println!("  {}: {}", style(&failed.id).red(), failed.failure);
        }
    }

    let metrics = &report.metrics;
    println!(
        "Speedup {:.2}x over {} wave(s), peak concurrency {}/{}, {} retr{}",
        metrics.speedup,
        metrics.waves.len(),
        metrics.peak_concurrency,
        metrics.max_concurrency,
        metrics.retries,
        if metrics.retries == 1 { "y" } else { "ies" }
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_simulated_generator_outcomes() {
        let generator = SimulatedGenerator::new(
            Duration::from_millis(50),
            &["bad".to_string()],
            &["flaky".to_string()],
        );

        let ok = generator.execute(&WorkItem::new("ok", &[])).await.unwrap();
        assert!(ok.contains("ok"));

        let bad = generator.execute(&WorkItem::new("bad", &[])).await;
        assert!(matches!(bad, Err(CallError::Fatal(_))));

        let flaky = WorkItem::new("flaky", &[]);
        assert!(matches!(
            generator.execute(&flaky).await,
            Err(CallError::Transient(_))
        ));
        assert!(generator.execute(&flaky).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_refuses_non_finite_config() {
        let mut config = DocflowConfig::default();
        config.notifications.max_rate_per_project = f64::NAN;
        let options = RunOptions {
            catalog: PathBuf::from("does-not-matter.json"),
            ids: Vec::new(),
            project: "p".to_string(),
            delay: Duration::ZERO,
            fail: Vec::new(),
            flaky: Vec::new(),
            ui: UiMode::Minimal,
            print_report: false,
        };

        let err = cmd_run(config, options).await.unwrap_err();
        assert!(format!("{:#}", err).contains("max_rate_per_project"));
    }
}

//! Execution state tracking for a scheduling run.
//!
//! This module provides the run-level state, per-item results and the
//! summary reported when a run ends.

use crate::errors::NodeFailure;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Graph built but nothing dispatched yet
    #[default]
    Idle,
    /// Items are executing
    Running,
    /// Every item completed
    Completed,
    /// At least one item failed
    Failed,
    /// The run was cancelled before every item finished
    Cancelled,
}

impl RunState {
    /// Check if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the run is currently executing.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Result of a single work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResult {
    /// Work item id
    pub id: String,
    /// Whether the item completed
    pub success: bool,
    /// Times the external call was invoked
    pub attempts: u32,
    /// Generated output, present iff the item completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Failure, present iff the item failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<NodeFailure>,
    /// Wave the item was dispatched in; `None` if never dispatched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave: Option<usize>,
    /// Wall-clock time spent executing
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl ItemResult {
    /// Create a successful item result.
    pub fn success(id: &str, output: String, attempts: u32, wave: usize, duration: Duration) -> Self {
        Self {
            id: id.to_string(),
            success: true,
            attempts,
            output: Some(output),
            failure: None,
            wave: Some(wave),
            duration,
        }
    }

    /// Create a failed item result.
    pub fn failure(id: &str, failure: NodeFailure, attempts: u32, wave: Option<usize>, duration: Duration) -> Self {
        Self {
            id: id.to_string(),
            success: false,
            attempts,
            output: None,
            failure: Some(failure),
            wave,
            duration,
        }
    }

    /// Create a result for an item that was never dispatched.
    pub fn not_dispatched(id: &str, failure: NodeFailure) -> Self {
        Self::failure(id, failure, 0, None, Duration::ZERO)
    }

    /// Whether this item was skipped because a dependency failed.
    pub fn is_skipped(&self) -> bool {
        self.failure.as_ref().is_some_and(NodeFailure::is_skip)
    }
}

/// A failed item and the reason, for the run's failure list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub id: String,
    pub failure: NodeFailure,
}

/// Summary of run results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Total items in the run
    pub total_items: usize,
    /// Items that completed
    pub completed: usize,
    /// Items that failed while (or instead of) executing
    pub failed: usize,
    /// Items failed by cascade, a subset of `failed`
    pub skipped: usize,
    /// Total execution time
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Results for each item
    #[serde(default)]
    pub item_results: BTreeMap<String, ItemResult>,
}

impl RunSummary {
    /// Create a new empty summary.
    pub fn new(total_items: usize) -> Self {
        Self {
            total_items,
            ..Default::default()
        }
    }

    /// Add an item result to the summary.
    pub fn add_result(&mut self, result: ItemResult) {
        if result.success {
            self.completed += 1;
        } else {
            self.failed += 1;
            if result.is_skipped() {
                self.skipped += 1;
            }
        }
        self.item_results.insert(result.id.clone(), result);
    }

    /// Check if all items completed successfully.
    pub fn all_success(&self) -> bool {
        self.failed == 0 && self.completed == self.total_items
    }

    /// Items that reached a terminal state.
    pub fn terminal_count(&self) -> usize {
        self.completed + self.failed
    }

    /// Get completion percentage.
    pub fn completion_percentage(&self) -> f64 {
        if self.total_items == 0 {
            return 100.0;
        }
        (self.completed as f64 / self.total_items as f64) * 100.0
    }

    /// Failed items with their reasons, ordered by id.
    pub fn failures(&self) -> Vec<FailedItem> {
        self.item_results
            .values()
            .filter_map(|r| {
                r.failure.as_ref().map(|f| FailedItem {
                    id: r.id.clone(),
                    failure: f.clone(),
                })
            })
            .collect()
    }

    /// Output of a completed item.
    pub fn output(&self, id: &str) -> Option<&str> {
        self.item_results.get(id).and_then(|r| r.output.as_deref())
    }
}

/// Tracks execution timing on tokio's clock.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Serde helpers for Duration serialization.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_terminal() {
        assert!(!RunState::Idle.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
    }

    #[test]
    fn test_item_result_success() {
        let result = ItemResult::success("intro", "text".into(), 1, 0, Duration::from_secs(2));
        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("text"));
        assert!(result.failure.is_none());
    }

    #[test]
    fn test_run_summary_counts() {
        let mut summary = RunSummary::new(4);

        summary.add_result(ItemResult::success("A", "a".into(), 1, 0, Duration::from_secs(1)));
        summary.add_result(ItemResult::success("C", "c".into(), 2, 1, Duration::from_secs(1)));
        summary.add_result(ItemResult::failure(
            "B",
            NodeFailure::ExecutionFailed {
                attempts: 1,
                cause: "bad input".into(),
            },
            1,
            Some(1),
            Duration::from_secs(1),
        ));
        summary.add_result(ItemResult::not_dispatched(
            "D",
            NodeFailure::Skipped {
                failed_dependencies: vec!["B".into()],
            },
        ));

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.terminal_count(), 4);
        assert!(!summary.all_success());
        assert_eq!(summary.completion_percentage(), 50.0);
        assert_eq!(summary.output("C"), Some("c"));

        let failures = summary.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].id, "B");
        assert_eq!(failures[1].id, "D");
    }

    #[test]
    fn test_summary_serializes_durations_as_millis() {
        let mut summary = RunSummary::new(1);
        summary.add_result(ItemResult::success("A", "a".into(), 1, 0, Duration::from_millis(1500)));
        summary.duration = Duration::from_millis(1500);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["duration"], 1500);
        assert_eq!(json["item_results"]["A"]["duration"], 1500);
    }
}

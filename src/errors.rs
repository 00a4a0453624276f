//! Typed error hierarchy for the docflow scheduler.
//!
//! One enum per subsystem:
//! - `CatalogError`: catalog loading and dependency resolution (fatal, pre-run)
//! - `RateLimitError`: admission refusals from the dual-window limiter
//! - `CallError`: the three-way classification of the external generation call
//! - `RetryError`: outcome of the retry coordinator when a call never succeeded
//! - `NodeFailure`: why a single node ended `Failed` (tagged, never parsed)
//! - `PublishError`: notification transport failures (never fatal to a run)
//! - `ConfigError`: configuration loading and environment overrides

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading a catalog or resolving its dependency graph.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read catalog at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse catalog: {0}")]
    Parse(String),

    #[error("Unsupported catalog format '{0}' (expected .json, .yaml, .yml or .toml)")]
    UnsupportedFormat(String),

    #[error("Duplicate work item id: {0}")]
    DuplicateId(String),

    #[error("Unknown work item id(s): {}. Valid ids: {}", .ids.join(", "), .valid.join(", "))]
    UnknownIds { ids: Vec<String>, valid: Vec<String> },

    #[error("Unknown dependency '{dependency}' in work item '{item}'. Valid ids: {}", .valid.join(", "))]
    UnknownDependency {
        item: String,
        dependency: String,
        valid: Vec<String>,
    },

    #[error("Cycle detected in dependencies: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// Admission refusals from the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// The sliding window is full; capacity frees up after `retry_after`.
    #[error("Per-minute limit reached ({used}/{cap}); retry in {retry_after:?}")]
    WindowFull {
        used: usize,
        cap: usize,
        retry_after: Duration,
    },

    /// The daily budget is spent. Not worth retrying before the date rolls over.
    #[error("Daily limit reached ({used}/{cap}); no further calls until tomorrow")]
    DailyExhausted { used: u64, cap: u64 },
}

impl RateLimitError {
    /// Whether waiting a short while can clear this condition.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::WindowFull { .. })
    }
}

/// Classified failure of the opaque external call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Fatal failure: {0}")]
    Fatal(String),
}

impl CallError {
    /// Rate-limit and transient errors are retried; fatal ones are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Transient(_))
    }
}

/// Final outcome of the retry coordinator when the call did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError {
    #[error("Gave up after {attempts} attempts: {cause}")]
    Exhausted { attempts: u32, cause: CallError },

    #[error("Non-retryable failure on attempt {attempt}: {cause}")]
    Fatal { attempt: u32, cause: CallError },

    #[error("Quota refused the call: {0}")]
    Quota(RateLimitError),

    #[error("Cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl RetryError {
    /// Number of times the external call was actually invoked.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts } => *attempts,
            Self::Fatal { attempt, .. } => *attempt,
            Self::Quota(_) => 0,
        }
    }
}

/// Why a node ended in the `Failed` state.
///
/// Dependents branch on the variant rather than on message text: a `Skipped`
/// node was never dispatched, everything else was at least attempted or
/// abandoned by the scheduler itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeFailure {
    #[error("Skipped: dependency failed ({})", .failed_dependencies.join(", "))]
    Skipped { failed_dependencies: Vec<String> },

    #[error("Execution failed after {attempts} attempt(s): {cause}")]
    ExecutionFailed { attempts: u32, cause: String },

    #[error("Daily quota exhausted: {message}")]
    QuotaExhausted { message: String },

    #[error("Cancelled before completion")]
    Cancelled,

    #[error("Unresolved: dependencies never completed")]
    Unresolved,

    #[error("Worker panicked: {message}")]
    Panicked { message: String },
}

impl NodeFailure {
    /// Whether this failure is a cascade from an upstream node.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

impl From<RetryError> for NodeFailure {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Quota(limit) => NodeFailure::QuotaExhausted {
                message: limit.to_string(),
            },
            RetryError::Cancelled { .. } => NodeFailure::Cancelled,
            other => NodeFailure::ExecutionFailed {
                attempts: other.attempts(),
                cause: other.to_string(),
            },
        }
    }
}

/// A node state change that would break the monotonic lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid transition for '{id}': {from} -> {to}")]
pub struct InvalidTransition {
    pub id: String,
    pub from: &'static str,
    pub to: &'static str,
}

/// Notification transport failures. The throttler keeps the event queued and
/// invokes its fallback hook instead of propagating these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("Notification transport unavailable: {0}")]
    Unavailable(String),

    #[error("Channel {channel} is saturated")]
    Saturated { channel: String },

    #[error("Failed to encode event: {0}")]
    Encode(String),
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config file at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value for {key}: '{value}'")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {}", .problems.join("; "))]
    Invalid { problems: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_renders_full_path() {
        let err = CatalogError::Cycle {
            path: vec!["A".into(), "B".into(), "C".into(), "A".into()],
        };
        assert_eq!(
            err.to_string(),
            "Cycle detected in dependencies: A -> B -> C -> A"
        );
    }

    #[test]
    fn unknown_ids_lists_valid_ids() {
        let err = CatalogError::UnknownIds {
            ids: vec!["nope".into()],
            valid: vec!["a".into(), "b".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("nope"));
        assert!(msg.contains("a, b"));
    }

    #[test]
    fn call_error_classification() {
        assert!(CallError::RateLimited("429".into()).is_retryable());
        assert!(CallError::Transient("reset".into()).is_retryable());
        assert!(!CallError::Fatal("bad input".into()).is_retryable());
    }

    #[test]
    fn rate_limit_error_recoverability() {
        let window = RateLimitError::WindowFull {
            used: 9,
            cap: 9,
            retry_after: Duration::from_secs(3),
        };
        let daily = RateLimitError::DailyExhausted { used: 900, cap: 900 };
        assert!(window.is_recoverable());
        assert!(!daily.is_recoverable());
        assert!(daily.to_string().contains("Daily"));
        assert!(window.to_string().contains("Per-minute"));
    }

    #[test]
    fn retry_error_maps_to_node_failure() {
        let exhausted = RetryError::Exhausted {
            attempts: 4,
            cause: CallError::Transient("timeout".into()),
        };
        match NodeFailure::from(exhausted) {
            NodeFailure::ExecutionFailed { attempts, cause } => {
                assert_eq!(attempts, 4);
                assert!(cause.contains("timeout"));
            }
            other => panic!("Expected ExecutionFailed, got {other:?}"),
        }

        let quota = RetryError::Quota(RateLimitError::DailyExhausted { used: 1, cap: 1 });
        assert!(matches!(
            NodeFailure::from(quota),
            NodeFailure::QuotaExhausted { .. }
        ));
        assert_eq!(
            NodeFailure::from(RetryError::Cancelled { attempts: 1 }),
            NodeFailure::Cancelled
        );
    }

    #[test]
    fn node_failure_serializes_with_kind_tag() {
        let failure = NodeFailure::Skipped {
            failed_dependencies: vec!["B".into()],
        };
        let json = serde_json::to_string(&failure).unwrap();
        assert!(json.contains("\"kind\":\"skipped\""));
        assert!(json.contains("\"B\""));
        assert!(failure.is_skip());
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&CatalogError::DuplicateId("x".into()));
        assert_std_error(&CallError::Fatal("x".into()));
        assert_std_error(&RetryError::Cancelled { attempts: 0 });
        assert_std_error(&NodeFailure::Cancelled);
        assert_std_error(&PublishError::Unavailable("down".into()));
    }
}

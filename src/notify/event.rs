//! Progress event schema shared by the executor, throttler and UI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether an event describes one item or the run as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Progress,
    Status,
}

/// Item or run status carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    InProgress,
    Running,
    Complete,
    Failed,
    Skipped,
    Retrying,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::InProgress => "in_progress",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
        }
    }

    /// Statuses after which an item or run changes no further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress snapshot, serialized as JSON on the project channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub status: EventStatus,
    /// Items that finished successfully; failed and skipped items are not
    /// counted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Item-level transition with run counters.
    pub fn progress(
        project_id: impl Into<String>,
        item_id: impl Into<String>,
        status: EventStatus,
        completed: usize,
        total: usize,
    ) -> Self {
        Self {
            kind: EventKind::Progress,
            project_id: project_id.into(),
            item_id: Some(item_id.into()),
            status,
            completed_count: Some(completed),
            total_count: Some(total),
            message: None,
            timestamp: Utc::now(),
        }
    }

    /// Run-level (or item-level, with [`for_item`](Self::for_item)) status.
    pub fn status(project_id: impl Into<String>, status: EventStatus) -> Self {
        Self {
            kind: EventKind::Status,
            project_id: project_id.into(),
            item_id: None,
            status,
            completed_count: None,
            total_count: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_item(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    pub fn with_counts(mut self, completed: usize, total: usize) -> Self {
        self.completed_count = Some(completed);
        self.total_count = Some(total);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_event_wire_shape() {
        let event = ProgressEvent::progress("p1", "intro", EventStatus::Complete, 2, 5);
        let value: serde_json::Value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "progress");
        assert_eq!(value["project_id"], "p1");
        assert_eq!(value["item_id"], "intro");
        assert_eq!(value["status"], "complete");
        assert_eq!(value["completed_count"], 2);
        assert_eq!(value["total_count"], 5);
        assert!(value["timestamp"].is_string());
        assert!(value.get("message").is_none());
    }

    #[test]
    fn test_status_event_omits_item_fields() {
        let event = ProgressEvent::status("p1", EventStatus::InProgress);
        let json = event.to_json().unwrap();

        assert!(json.contains("\"type\":\"status\""));
        assert!(json.contains("\"status\":\"in_progress\""));
        assert!(!json.contains("item_id"));
        assert_eq!(ProgressEvent::from_json(&json).unwrap(), event);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(EventStatus::Complete.is_terminal());
        assert!(EventStatus::Skipped.is_terminal());
        assert!(!EventStatus::Retrying.is_terminal());
        assert!(!EventStatus::Running.is_terminal());
    }
}

//! Progress events published while a task runs.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ids::TaskId;

/// Kind of progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressKind {
    Started {
        segment_count: u32,
    },
    Progress {
        pct: u8,
    },
    SegmentDone {
        index: u32,
        completed: u32,
        total: u32,
    },
    Merged,
    Completed {
        video_url: String,
    },
    Failed {
        message: String,
        will_retry: bool,
    },
    Log {
        message: String,
    },
}

/// Timestamped event for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ProgressKind,
}

impl ProgressEvent {
    pub fn new(task_id: TaskId, kind: ProgressKind) -> Self {
        Self {
            task_id,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn progress(task_id: TaskId, pct: u8) -> Self {
        Self::new(task_id, ProgressKind::Progress { pct })
    }

    pub fn log(task_id: TaskId, message: impl Into<String>) -> Self {
        Self::new(
            task_id,
            ProgressKind::Log {
                message: message.into(),
            },
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            ProgressKind::Completed { .. } | ProgressKind::Failed { will_retry: false, .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let id = TaskId::new();
        let event = ProgressEvent::progress(id, 40);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "progress");
        assert_eq!(json["pct"], 40);
        assert_eq!(json["task_id"], id.to_string());
    }

    #[test]
    fn test_terminal_events() {
        let id = TaskId::new();
        let retrying = ProgressEvent::new(
            id,
            ProgressKind::Failed {
                message: "boom".into(),
                will_retry: true,
            },
        );
        assert!(!retrying.is_terminal());
        assert!(ProgressEvent::new(id, ProgressKind::Completed { video_url: "u".into() }).is_terminal());
    }
}

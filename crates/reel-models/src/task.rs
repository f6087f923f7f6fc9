//! Task record and state machine.
//!
//! A task moves `pending -> processing -> completed | failed`, or directly
//! `pending -> failed` when its job can never start. It never re-enters
//! `pending`. All mutations go through [`Task::apply`] so every store enforces
//! the same transitions.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cost::CostBreakdown;
use crate::ids::TaskId;
use crate::job::Priority;
use crate::segment::{Segment, SegmentationResult, SegmentationStrategy};
use crate::voice::{VoiceParams, VoiceRef};

/// Progress after the task is claimed.
pub const PROGRESS_STARTED: u8 = 10;
/// Progress before the first segment finishes.
pub const PROGRESS_SEGMENTS_START: u8 = 20;
/// Progress once every segment finished.
pub const PROGRESS_SEGMENTS_END: u8 = 80;
/// Progress after the merge step.
pub const PROGRESS_MERGED: u8 = 85;
pub const PROGRESS_DONE: u8 = 100;

/// Progress after `done` of `total` segments finished.
pub fn segment_progress(done: u32, total: u32) -> u8 {
    if total == 0 {
        return PROGRESS_SEGMENTS_END;
    }
    let span = (PROGRESS_SEGMENTS_END - PROGRESS_SEGMENTS_START) as u32;
    let done = done.min(total);
    PROGRESS_SEGMENTS_START + (span * done / total) as u8
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Video template used by the talking-head synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TemplateRef {
    pub template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
}

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskSpec {
    pub source_text: String,
    pub voice: VoiceRef,
    #[serde(default)]
    pub voice_params: VoiceParams,
    pub template: TemplateRef,
    #[serde(default)]
    pub is_custom_template: bool,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub strategy: SegmentationStrategy,
}

/// Per-segment checkpoint recorded once the segment's video is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SegmentOutput {
    pub index: u32,
    pub audio_url: String,
    pub video_url: String,
}

/// Final artifacts of a completed task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct TaskOutputs {
    pub video_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

/// Closed set of mutations the pipeline and submission boundary may apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskUpdate {
    Start,
    Progress { pct: u8 },
    SegmentDone(SegmentOutput),
    Complete(TaskOutputs),
    Fail { message: String },
    MarkRefunded,
}

impl TaskUpdate {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Progress { .. } => "progress",
            Self::SegmentDone(_) => "segment_done",
            Self::Complete(_) => "complete",
            Self::Fail { .. } => "fail",
            Self::MarkRefunded => "mark_refunded",
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail {
            message: message.into(),
        }
    }
}

/// Rejected state transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot apply {update} to a {from} task")]
    InvalidTransition { from: TaskStatus, update: &'static str },

    #[error("task already refunded")]
    AlreadyRefunded,

    #[error("completion requires a video output")]
    MissingOutputs,

    #[error("segment {0} is not part of the plan")]
    UnknownSegment(u32),
}

/// One end-to-end text-to-video request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Task {
    pub id: TaskId,
    pub owner_id: String,
    pub source_text: String,
    pub voice: VoiceRef,
    pub voice_params: VoiceParams,
    pub template: TemplateRef,
    pub is_custom_template: bool,
    pub priority: Priority,
    pub strategy: SegmentationStrategy,
    pub cost: CostBreakdown,
    pub needs_segmentation: bool,
    /// Persisted segmentation plan
    pub segments: Vec<Segment>,
    pub status: TaskStatus,
    pub progress_pct: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub segment_outputs: Vec<SegmentOutput>,
    #[serde(default)]
    pub refunded: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task from a request and its segmentation plan.
    pub fn new(
        owner_id: impl Into<String>,
        spec: TaskSpec,
        plan: SegmentationResult,
        cost: CostBreakdown,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            owner_id: owner_id.into(),
            source_text: spec.source_text,
            voice: spec.voice,
            voice_params: spec.voice_params,
            template: spec.template,
            is_custom_template: spec.is_custom_template,
            priority: spec.priority,
            strategy: plan.strategy,
            cost,
            needs_segmentation: plan.needs_segmentation,
            segments: plan.segments,
            status: TaskStatus::Pending,
            progress_pct: 0,
            result_audio_url: None,
            result_video_url: None,
            thumbnail_url: None,
            error_message: None,
            segment_outputs: Vec::new(),
            refunded: false,
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Segments the pipeline synthesizes, in index order.
    pub fn work_segments(&self) -> Vec<Segment> {
        if self.needs_segmentation && !self.segments.is_empty() {
            let mut segments = self.segments.clone();
            segments.sort_by_key(|s| s.index);
            return segments;
        }
        let text = self.source_text.trim();
        let char_count = text.chars().count() as u32;
        vec![Segment {
            index: 0,
            offset: 0,
            text: text.to_string(),
            char_count,
            estimated_duration_sec: crate::segment::estimate_duration_secs(char_count),
        }]
    }

    pub fn output_for(&self, index: u32) -> Option<&SegmentOutput> {
        self.segment_outputs.iter().find(|o| o.index == index)
    }

    /// Whether the credits of this task still have to be returned.
    pub fn needs_refund(&self) -> bool {
        self.status == TaskStatus::Failed && !self.refunded && self.cost.total > 0
    }

    fn invalid(&self, update: &TaskUpdate) -> TransitionError {
        TransitionError::InvalidTransition {
            from: self.status,
            update: update.name(),
        }
    }

    /// Apply one mutation, enforcing the state machine.
    pub fn apply(&mut self, update: TaskUpdate) -> Result<(), TransitionError> {
        let now = Utc::now();
        match (self.status, &update) {
            (TaskStatus::Pending, TaskUpdate::Start) => {
                self.status = TaskStatus::Processing;
                self.started_at = Some(now);
                self.progress_pct = self.progress_pct.max(PROGRESS_STARTED);
            }
            // Retried job resuming the same task
            (TaskStatus::Processing, TaskUpdate::Start) => {}

            (TaskStatus::Processing, TaskUpdate::Progress { pct }) => {
                self.progress_pct = self.progress_pct.max((*pct).min(PROGRESS_DONE));
            }

            (TaskStatus::Processing, TaskUpdate::SegmentDone(output)) => {
                if !self.work_segments().iter().any(|s| s.index == output.index) {
                    return Err(TransitionError::UnknownSegment(output.index));
                }
                match self.segment_outputs.iter_mut().find(|o| o.index == output.index) {
                    Some(existing) => *existing = output.clone(),
                    None => {
                        self.segment_outputs.push(output.clone());
                        self.segment_outputs.sort_by_key(|o| o.index);
                    }
                }
            }

            (TaskStatus::Processing, TaskUpdate::Complete(outputs)) => {
                if outputs.video_url.is_empty() {
                    return Err(TransitionError::MissingOutputs);
                }
                self.status = TaskStatus::Completed;
                self.progress_pct = PROGRESS_DONE;
                self.result_video_url = Some(outputs.video_url.clone());
                self.result_audio_url = outputs.audio_url.clone();
                self.thumbnail_url = outputs.thumbnail_url.clone();
                self.error_message = None;
                self.completed_at = Some(now);
            }

            (TaskStatus::Pending | TaskStatus::Processing, TaskUpdate::Fail { message }) => {
                self.status = TaskStatus::Failed;
                self.error_message = Some(message.clone());
                self.completed_at = Some(now);
            }

            (TaskStatus::Failed, TaskUpdate::MarkRefunded) => {
                if self.refunded {
                    return Err(TransitionError::AlreadyRefunded);
                }
                self.refunded = true;
            }

            _ => return Err(self.invalid(&update)),
        }
        self.updated_at = now;
        Ok(())
    }
}

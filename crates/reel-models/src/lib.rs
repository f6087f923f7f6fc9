//! Shared domain models for the Reel generation pipeline.
//!
//! This crate provides Serde-serializable types and pure functions for:
//! - Text segmentation and duration estimation
//! - Credit cost estimation
//! - The task state machine
//! - Queue job records and priorities
//! - Voice/emotion parameters
//! - Progress events

pub mod cost;
pub mod event;
pub mod ids;
pub mod job;
pub mod segment;
pub mod task;
pub mod voice;

// Re-export common types
pub use cost::{estimate_cost, CostBreakdown, CostEstimator, CostRates};
pub use event::{ProgressEvent, ProgressKind};
pub use ids::TaskId;
pub use job::{Job, JobState, Priority};
pub use segment::{
    estimate_duration_secs, reconstruct, segment, segment_at_offsets, split_sentences, Segment,
    SegmentBounds, SegmentError, SegmentResult, SegmentationResult, SegmentationStrategy,
    CHARS_PER_SECOND,
};
pub use task::{
    segment_progress, SegmentOutput, Task, TaskOutputs, TaskSpec, TaskStatus, TaskUpdate, TemplateRef,
    TransitionError, PROGRESS_DONE, PROGRESS_MERGED, PROGRESS_SEGMENTS_END,
    PROGRESS_SEGMENTS_START, PROGRESS_STARTED,
};
pub use voice::{Emotion, VoiceParams, VoiceRef, EMOTION_AXES};

//! Task submission, lookup and deletion.
//!
//! Submission validates the request, plans and prices the segmentation,
//! debits the owner and only then creates and enqueues the task. A debit is
//! refunded when anything after it fails, so a rejected submission never
//! costs credits.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{error, info, warn};
use validator::Validate;

use reel_models::{
    segment, segment_at_offsets, CostBreakdown, CostEstimator, CostRates, Emotion, JobState, Priority, SegmentationResult,
    SegmentationStrategy, Task, TaskId, TaskSpec, TaskStatus, TaskUpdate, TemplateRef, TransitionError, VoiceParams,
    VoiceRef,
};
use reel_queue::JobQueue;
use reel_storage::{keys, ArtifactStore};
use reel_store::{refund_key, CreditLedger, StoreError, TaskStore};

use crate::error::{ApiError, ApiResult};
use crate::metrics;

/// Emotion and prosody controls as accepted over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Validate, JsonSchema)]
pub struct VoiceParamsInput {
    #[serde(default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub happiness: f32,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub anger: f32,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub sadness: f32,
    #[serde(default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub surprise: f32,
    #[serde(default = "default_emotion_alpha")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub emotion_alpha: f32,
    #[serde(default = "default_scale")]
    #[validate(range(min = 0.5, max = 2.0))]
    pub pitch_scale: f32,
    #[serde(default = "default_scale")]
    #[validate(range(min = 0.5, max = 2.0))]
    pub speed_scale: f32,
}

fn default_emotion_alpha() -> f32 {
    VoiceParams::default().emotion_alpha
}

fn default_scale() -> f32 {
    1.0
}

impl Default for VoiceParamsInput {
    fn default() -> Self {
        VoiceParams::default().into()
    }
}

impl From<VoiceParams> for VoiceParamsInput {
    fn from(params: VoiceParams) -> Self {
        Self {
            happiness: params.emotion.happiness,
            anger: params.emotion.anger,
            sadness: params.emotion.sadness,
            surprise: params.emotion.surprise,
            emotion_alpha: params.emotion_alpha,
            pitch_scale: params.pitch_scale,
            speed_scale: params.speed_scale,
        }
    }
}

impl From<VoiceParamsInput> for VoiceParams {
    fn from(input: VoiceParamsInput) -> Self {
        Self {
            emotion: Emotion {
                happiness: input.happiness,
                anger: input.anger,
                sadness: input.sadness,
                surprise: input.surprise,
            },
            emotion_alpha: input.emotion_alpha,
            pitch_scale: input.pitch_scale,
            speed_scale: input.speed_scale,
        }
    }
}

/// Request body for estimates and submissions.
#[derive(Debug, Clone, Deserialize, Validate, JsonSchema)]
pub struct TaskRequest {
    pub text: String,
    #[validate(length(min = 1, max = 128))]
    pub voice_id: String,
    /// Reference recording for a cloned voice
    #[serde(default)]
    #[validate(url)]
    pub reference_audio_url: Option<String>,
    #[serde(default)]
    pub custom_voice: bool,
    #[validate(length(min = 1, max = 128))]
    pub template_id: String,
    #[serde(default)]
    #[validate(url)]
    pub template_video_url: Option<String>,
    #[serde(default)]
    pub custom_template: bool,
    #[serde(default)]
    #[validate(nested)]
    pub voice_params: VoiceParamsInput,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub strategy: SegmentationStrategy,
    /// Manual split points (character offsets); overrides `strategy`
    #[serde(default)]
    #[validate(length(max = 500))]
    pub split_offsets: Option<Vec<u32>>,
}

impl TaskRequest {
    /// Minimal request with default voice parameters.
    pub fn new(text: impl Into<String>, voice_id: impl Into<String>, template_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice_id: voice_id.into(),
            reference_audio_url: None,
            custom_voice: false,
            template_id: template_id.into(),
            template_video_url: None,
            custom_template: false,
            voice_params: VoiceParamsInput::default(),
            priority: Priority::default(),
            strategy: SegmentationStrategy::default(),
            split_offsets: None,
        }
    }

    fn into_spec(self) -> TaskSpec {
        TaskSpec {
            source_text: self.text,
            voice: VoiceRef {
                voice_id: self.voice_id,
                reference_audio_url: self.reference_audio_url,
                is_custom: self.custom_voice,
            },
            voice_params: self.voice_params.into(),
            template: TemplateRef {
                template_id: self.template_id,
                video_url: self.template_video_url,
            },
            is_custom_template: self.custom_template,
            priority: self.priority,
            strategy: self.strategy,
        }
    }
}

/// Estimate plus the plan it was priced from.
#[derive(Debug, Clone)]
pub struct Quote {
    pub plan: SegmentationResult,
    pub cost: CostBreakdown,
}

/// Outcome of a deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deleted {
    pub previous_status: TaskStatus,
    pub refunded: u32,
}

/// Entry point for everything that creates or removes tasks.
#[derive(Clone)]
pub struct SubmissionService {
    store: Arc<dyn TaskStore>,
    ledger: Arc<dyn CreditLedger>,
    queue: Arc<dyn JobQueue>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    rates: CostRates,
    max_text_chars: usize,
}

impl SubmissionService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        ledger: Arc<dyn CreditLedger>,
        queue: Arc<dyn JobQueue>,
        rates: CostRates,
        max_text_chars: usize,
    ) -> Self {
        Self {
            store,
            ledger,
            queue,
            artifacts: None,
            rates,
            max_text_chars,
        }
    }

    /// Remove stored artifacts when a task is deleted.
    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Validate and price a request without charging for it.
    pub fn estimate(&self, request: &TaskRequest) -> ApiResult<CostBreakdown> {
        Ok(self.quote(request)?.cost)
    }

    /// Validate, segment and price a request.
    pub fn quote(&self, request: &TaskRequest) -> ApiResult<Quote> {
        self.validate(request)?;

        let plan = match &request.split_offsets {
            Some(offsets) => segment_at_offsets(&request.text, offsets)?,
            None => segment(&request.text, request.strategy)?,
        };
        let cost = CostEstimator::new(&request.text)
            .with_custom_voice(request.custom_voice)
            .with_custom_template(request.custom_template)
            .with_rates(self.rates)
            .price(&plan);

        Ok(Quote { plan, cost })
    }

    fn validate(&self, request: &TaskRequest) -> ApiResult<()> {
        request.validate()?;

        if request.text.trim().is_empty() {
            return Err(ApiError::validation("text is empty"));
        }
        let chars = request.text.chars().count();
        if chars > self.max_text_chars {
            return Err(ApiError::validation(format!(
                "text is {} characters, limit is {}",
                chars, self.max_text_chars
            )));
        }
        if request.custom_voice && request.reference_audio_url.is_none() {
            return Err(ApiError::validation("a custom voice needs reference_audio_url"));
        }
        if request.custom_template && request.template_video_url.is_none() {
            return Err(ApiError::validation("a custom template needs template_video_url"));
        }
        Ok(())
    }

    /// Charge for and queue a new task.
    pub async fn submit(&self, owner_id: &str, request: TaskRequest) -> ApiResult<Task> {
        let Quote { plan, cost } = self.quote(&request)?;

        if !self.ledger.debit(owner_id, cost.total).await? {
            let available = self.ledger.balance(owner_id).await?;
            info!(owner_id, required = cost.total, available, "Submission rejected for credits");
            return Err(ApiError::InsufficientCredits {
                required: cost.total,
                available,
            });
        }

        let task = Task::new(owner_id, request.into_spec(), plan, cost);
        if let Err(e) = self.persist_and_enqueue(&task).await {
            warn!(task_id = %task.id, "Submission failed after debit: {}", e);
            self.release(&task).await;
            return Err(e);
        }

        info!(
            task_id = %task.id,
            owner_id,
            segments = task.cost.segment_count,
            credits = task.cost.total,
            priority = task.priority.as_str(),
            "Task submitted"
        );
        metrics::record_task_submitted(task.priority.as_str(), task.cost.total);
        Ok(task)
    }

    async fn persist_and_enqueue(&self, task: &Task) -> ApiResult<()> {
        self.store.create(task).await?;
        self.queue.enqueue(task.id, task.priority).await?;
        Ok(())
    }

    /// Undo a half-finished submission.
    async fn release(&self, task: &Task) {
        if let Err(e) = self.store.delete(task.id).await {
            warn!(task_id = %task.id, "Failed to remove task record: {}", e);
        }
        if task.cost.total == 0 {
            return;
        }
        match self
            .ledger
            .refund(&task.owner_id, task.cost.total, &refund_key(task.id))
            .await
        {
            Ok(_) => metrics::record_refund("submission"),
            Err(e) => error!(
                task_id = %task.id,
                owner_id = %task.owner_id,
                credits = task.cost.total,
                "Failed to refund debit: {}",
                e
            ),
        }
    }

    /// Fetch a task owned by `owner_id`.
    pub async fn get(&self, owner_id: &str, id: TaskId) -> ApiResult<Task> {
        match self.store.get(id).await? {
            Some(task) if task.owner_id == owner_id => Ok(task),
            _ => Err(ApiError::not_found(format!("task {id}"))),
        }
    }

    /// Tasks owned by `owner_id`, newest first.
    pub async fn list(&self, owner_id: &str) -> ApiResult<Vec<Task>> {
        Ok(self.store.list_by_owner(owner_id).await?)
    }

    /// Delete a task, refunding it when it never produced a result.
    ///
    /// Pending tasks are pulled from the queue first; a task whose job was
    /// already claimed, or that is processing, is rejected with a conflict.
    pub async fn delete(&self, owner_id: &str, id: TaskId) -> ApiResult<Deleted> {
        let task = self.get(owner_id, id).await?;
        let previous_status = task.status;

        let refunded = match task.status {
            TaskStatus::Processing => {
                return Err(ApiError::conflict("task is processing"));
            }
            TaskStatus::Pending => {
                if !self.queue.remove(id).await? && self.job_is_active(id).await? {
                    return Err(ApiError::conflict("task has been picked up by a worker"));
                }
                let failed = self
                    .store
                    .apply(id, TaskUpdate::fail("deleted by owner"))
                    .await
                    .map_err(|e| match e {
                        StoreError::Transition(_) => ApiError::conflict("task has been picked up by a worker"),
                        other => other.into(),
                    })?;
                self.refund_failed(&failed).await?
            }
            TaskStatus::Failed => self.refund_failed(&task).await?,
            TaskStatus::Completed => 0,
        };

        self.store.delete(id).await?;
        if let Some(artifacts) = &self.artifacts {
            match artifacts.delete_prefix(&keys::task_prefix(id)).await {
                Ok(removed) if removed > 0 => info!(task_id = %id, removed, "Deleted task artifacts"),
                Ok(_) => {}
                Err(e) => warn!(task_id = %id, "Failed to delete task artifacts: {}", e),
            }
        }

        info!(task_id = %id, owner_id, status = %previous_status, refunded, "Task deleted");
        metrics::record_task_deleted(previous_status.as_str());
        Ok(Deleted {
            previous_status,
            refunded,
        })
    }

    async fn job_is_active(&self, id: TaskId) -> ApiResult<bool> {
        Ok(self
            .queue
            .get(id)
            .await?
            .is_some_and(|job| job.state == JobState::Active))
    }

    /// Refund a failed task unless it was already refunded. Returns the
    /// credits actually returned by this call.
    async fn refund_failed(&self, task: &Task) -> ApiResult<u32> {
        if !task.needs_refund() {
            return Ok(0);
        }

        let amount = task.cost.total;
        let applied = self.ledger.refund(&task.owner_id, amount, &refund_key(task.id)).await?;
        match self.store.apply(task.id, TaskUpdate::MarkRefunded).await {
            Ok(_) | Err(StoreError::Transition(TransitionError::AlreadyRefunded)) => {}
            Err(e) => return Err(e.into()),
        }

        if applied {
            metrics::record_refund("deletion");
            Ok(amount)
        } else {
            Ok(0)
        }
    }

    /// Current balance of `owner_id`.
    pub async fn balance(&self, owner_id: &str) -> ApiResult<u64> {
        Ok(self.ledger.balance(owner_id).await?)
    }
}

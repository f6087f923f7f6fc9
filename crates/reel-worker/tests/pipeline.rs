//! End-to-end worker tests against in-memory collaborators.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use reel_media::{MediaError, MediaProcessor, MediaResult, MergeOutput};
use reel_models::{
    segment, segment_at_offsets, CostEstimator, JobState, Priority, ProgressEvent, ProgressKind, SegmentOutput,
    SegmentationResult, SegmentationStrategy, Task, TaskId, TaskSpec, TaskStatus, TaskUpdate, TemplateRef,
    VoiceParams, VoiceRef,
};
use reel_queue::{JobQueue, MemoryJobQueue, ProgressPublisher, QueueConfig, QueueResult};
use reel_storage::LocalArtifactStore;
use reel_store::{
    refund_key, CreditLedger, MemoryCreditLedger, MemoryTaskStore, StoreError, StoreResult, TaskStore,
};
use reel_synth::{
    PollPolicy, SpeechRequest, SpeechSynthesizer, SynthError, SynthResult, VideoJobRequest, VideoJobStatus,
    VideoSynthesizer,
};
use reel_worker::{
    compensate, Compensation, JobExecutor, JobOutcome, PipelineDeps, PipelineSettings, TaskPipeline, WorkerConfig,
};

const OWNER: &str = "owner-1";
const OPENING_BALANCE: u64 = 100;

/// Speech service that echoes the text, failing the first `failures` calls.
#[derive(Default)]
struct FakeSpeech {
    failures: AtomicU32,
    texts: Mutex<Vec<String>>,
}

#[async_trait]
impl SpeechSynthesizer for FakeSpeech {
    async fn synthesize(&self, request: &SpeechRequest) -> SynthResult<Bytes> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SynthError::ServiceUnavailable("503 from speech service".into()));
        }
        self.texts.lock().unwrap().push(request.text.clone());
        Ok(Bytes::from(format!("WAV[{}]", request.text)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VideoMode {
    Complete,
    NeverFinish,
    Fail,
}

/// Video service that renders the submitted audio URL as the video body.
struct FakeVideo {
    mode: Mutex<VideoMode>,
    jobs: Mutex<Vec<String>>,
}

impl FakeVideo {
    fn new(mode: VideoMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            jobs: Mutex::new(Vec::new()),
        }
    }

    fn set_mode(&self, mode: VideoMode) {
        *self.mode.lock().unwrap() = mode;
    }
}

#[async_trait]
impl VideoSynthesizer for FakeVideo {
    async fn submit(&self, request: &VideoJobRequest) -> SynthResult<String> {
        let mut jobs = self.jobs.lock().unwrap();
        jobs.push(request.audio_url.clone());
        Ok(format!("job-{}", jobs.len() - 1))
    }

    async fn status(&self, job_id: &str) -> SynthResult<VideoJobStatus> {
        let mode = *self.mode.lock().unwrap();
        Ok(match mode {
            VideoMode::Complete => VideoJobStatus {
                completed: true,
                outputs: vec![format!("fake://{job_id}")],
                ..Default::default()
            },
            VideoMode::NeverFinish => VideoJobStatus::default(),
            VideoMode::Fail => VideoJobStatus {
                failed: true,
                error: Some("face not detected".into()),
                ..Default::default()
            },
        })
    }

    async fn download(&self, url: &str) -> SynthResult<Bytes> {
        let index: usize = url
            .trim_start_matches("fake://job-")
            .parse()
            .map_err(|_| SynthError::InvalidResponse(url.to_string()))?;
        let audio_url = self.jobs.lock().unwrap()[index].clone();
        Ok(Bytes::from(format!("MP4[{audio_url}]")))
    }
}

/// Media processor that concatenates file contents.
#[derive(Default)]
struct FakeMedia {
    merges: Mutex<Vec<Vec<String>>>,
    merge_times_out: AtomicBool,
}

async fn concat_files(inputs: &[PathBuf], output: &Path) -> MediaResult<u64> {
    if inputs.is_empty() {
        return Err(MediaError::NoInputs);
    }
    let mut joined = Vec::new();
    for input in inputs {
        joined.extend(tokio::fs::read(input).await?);
        joined.push(b'|');
    }
    tokio::fs::write(output, &joined).await?;
    Ok(joined.len() as u64)
}

#[async_trait]
impl MediaProcessor for FakeMedia {
    async fn merge_videos(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        _cancel: &CancellationToken,
    ) -> MediaResult<MergeOutput> {
        let names = inputs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        self.merges.lock().unwrap().push(names);
        if self.merge_times_out.load(Ordering::SeqCst) {
            return Err(MediaError::Timeout(1800));
        }
        let size_bytes = concat_files(inputs, output).await?;
        Ok(MergeOutput {
            path: output.to_path_buf(),
            duration_secs: inputs.len() as f64,
            size_bytes,
        })
    }

    async fn concat_audio(&self, inputs: &[PathBuf], output: &Path, _cancel: &CancellationToken) -> MediaResult<()> {
        concat_files(inputs, output).await.map(|_| ())
    }

    async fn thumbnail(&self, _video: &Path, output: &Path) -> MediaResult<()> {
        tokio::fs::write(output, b"JPEG").await?;
        Ok(())
    }
}

/// Task store that rejects the next `failing_fails` attempts to mark a task
/// failed, as if the store were briefly unreachable.
struct FlakyStore {
    inner: Arc<MemoryTaskStore>,
    failing_fails: AtomicU32,
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn create(&self, task: &Task) -> StoreResult<()> {
        self.inner.create(task).await
    }

    async fn get(&self, id: TaskId) -> StoreResult<Option<Task>> {
        self.inner.get(id).await
    }

    async fn list_by_owner(&self, owner_id: &str) -> StoreResult<Vec<Task>> {
        self.inner.list_by_owner(owner_id).await
    }

    async fn apply(&self, id: TaskId, update: TaskUpdate) -> StoreResult<Task> {
        if matches!(update, TaskUpdate::Fail { .. })
            && self
                .failing_fails
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::connection_failed("store unreachable"));
        }
        self.inner.apply(id, update).await
    }

    async fn delete(&self, id: TaskId) -> StoreResult<bool> {
        self.inner.delete(id).await
    }
}

#[derive(Default)]
struct RecordingPublisher {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingPublisher {
    fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProgressPublisher for RecordingPublisher {
    async fn publish(&self, event: &ProgressEvent) -> QueueResult<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct Harness {
    executor: JobExecutor,
    deps: PipelineDeps,
    store: Arc<MemoryTaskStore>,
    ledger: Arc<MemoryCreditLedger>,
    queue: Arc<MemoryJobQueue>,
    speech: Arc<FakeSpeech>,
    video: Arc<FakeVideo>,
    media: Arc<FakeMedia>,
    events: Arc<RecordingPublisher>,
    dir: tempfile::TempDir,
}

fn test_settings(dir: &Path) -> PipelineSettings {
    PipelineSettings {
        poll: PollPolicy {
            interval: Duration::from_millis(2),
            timeout: Duration::from_millis(30),
        },
        segment_parallelism: 1,
        work_dir: dir.join("work"),
    }
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryTaskStore::new());
        let ledger = Arc::new(MemoryCreditLedger::with_opening_balance(OPENING_BALANCE));
        let queue = Arc::new(MemoryJobQueue::new(QueueConfig {
            max_attempts: 3,
            backoff_base: Duration::ZERO,
            ..Default::default()
        }));
        let speech = Arc::new(FakeSpeech::default());
        let video = Arc::new(FakeVideo::new(VideoMode::Complete));
        let media = Arc::new(FakeMedia::default());
        let events = Arc::new(RecordingPublisher::default());

        let deps = PipelineDeps {
            store: store.clone(),
            ledger: ledger.clone(),
            queue: queue.clone(),
            artifacts: Arc::new(LocalArtifactStore::new(dir.path().join("artifacts")).unwrap()),
            speech: speech.clone(),
            video: video.clone(),
            media: media.clone(),
            progress: events.clone(),
        };
        let settings = PipelineSettings {
            segment_parallelism: 2,
            ..test_settings(dir.path())
        };
        let config = WorkerConfig {
            worker_id: "test-worker".into(),
            job_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let executor = JobExecutor::new(config, TaskPipeline::new(deps.clone(), settings));

        Self {
            executor,
            deps,
            store,
            ledger,
            queue,
            speech,
            video,
            media,
            events,
            dir,
        }
    }

    /// Debit, persist and enqueue a task the way the API does.
    async fn submit(&self, text: &str, plan: SegmentationResult) -> Task {
        let spec = TaskSpec {
            source_text: text.to_string(),
            voice: VoiceRef::preset("narrator"),
            voice_params: VoiceParams::default(),
            template: TemplateRef {
                template_id: "anchor".into(),
                video_url: None,
            },
            is_custom_template: false,
            priority: Priority::Normal,
            strategy: SegmentationStrategy::Auto,
        };
        let cost = CostEstimator::new(text).price(&plan);
        let task = Task::new(OWNER, spec, plan, cost);

        assert!(self.ledger.debit(OWNER, task.cost.total).await.unwrap());
        self.store.create(&task).await.unwrap();
        self.queue.enqueue(task.id, task.priority).await.unwrap();
        task
    }

    async fn submit_segmented(&self) -> Task {
        let text = "First part. Second part. Third part.";
        self.submit(text, segment_at_offsets(text, &[12, 25]).unwrap()).await
    }

    async fn submit_single(&self) -> Task {
        let text = "Just one short line.";
        self.submit(text, segment(text, SegmentationStrategy::Auto).unwrap()).await
    }

    /// Dequeue and run the next job.
    async fn run_next(&self) -> JobOutcome {
        let job = self
            .queue
            .dequeue("test-worker")
            .await
            .unwrap()
            .expect("a queued job");
        self.executor.handle_job(job, CancellationToken::new()).await
    }

    async fn task(&self, task: &Task) -> Task {
        self.store.get(task.id).await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn test_segmented_task_completes_in_order() {
    let h = Harness::new();
    let task = h.submit_segmented().await;
    assert!(task.needs_segmentation);
    assert_eq!(task.segments.len(), 3);

    assert_eq!(h.run_next().await, JobOutcome::Completed);

    let done = h.task(&task).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.progress_pct, 100);
    assert_eq!(done.segment_outputs.len(), 3);
    assert!(done.result_video_url.as_deref().unwrap().ends_with("final.mp4"));
    assert!(done.result_audio_url.as_deref().unwrap().ends_with("final.wav"));
    assert!(done.thumbnail_url.is_some());
    assert!(done.completed_at.is_some());

    // Merge input follows segment index order
    let merges = h.media.merges.lock().unwrap().clone();
    assert_eq!(
        merges,
        vec![vec!["segment_000.mp4".to_string(), "segment_001.mp4".into(), "segment_002.mp4".into()]]
    );

    let merged = std::fs::read_to_string(
        h.dir
            .path()
            .join("artifacts")
            .join(format!("tasks/{}/final.mp4", task.id)),
    )
    .unwrap();
    let first = merged.find("000.wav").unwrap();
    let second = merged.find("001.wav").unwrap();
    let third = merged.find("002.wav").unwrap();
    assert!(first < second && second < third);

    let job = h.queue.get(task.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
}

#[tokio::test]
async fn test_progress_is_monotonic_and_ends_at_100() {
    let h = Harness::new();
    let task = h.submit_segmented().await;
    h.run_next().await;

    let events = h.events.events();
    assert!(matches!(events[0].kind, ProgressKind::Started { segment_count: 3 }));
    assert!(matches!(events.last().unwrap().kind, ProgressKind::Completed { .. }));

    let pcts: Vec<u8> = events
        .iter()
        .filter_map(|e| match e.kind {
            ProgressKind::Progress { pct } => Some(pct),
            _ => None,
        })
        .collect();
    assert_eq!(pcts, vec![40, 60, 80, 85]);
    assert!(pcts.windows(2).all(|w| w[0] <= w[1]));
    assert!(events.iter().any(|e| e.kind == ProgressKind::Merged));
    assert_eq!(h.task(&task).await.progress_pct, 100);
}

#[tokio::test]
async fn test_single_segment_skips_merge() {
    let h = Harness::new();
    let task = h.submit_single().await;
    assert!(!task.needs_segmentation);

    assert_eq!(h.run_next().await, JobOutcome::Completed);

    let done = h.task(&task).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(h.media.merges.lock().unwrap().is_empty());
    assert_eq!(done.result_video_url, Some(done.segment_outputs[0].video_url.clone()));
    assert_eq!(done.result_audio_url, Some(done.segment_outputs[0].audio_url.clone()));
    assert_eq!(h.speech.texts.lock().unwrap().as_slice(), ["Just one short line."]);
}

#[tokio::test]
async fn test_poll_timeout_fails_and_refunds() {
    let h = Harness::new();
    h.video.set_mode(VideoMode::NeverFinish);
    let task = h.submit_single().await;
    let charged = OPENING_BALANCE - task.cost.total as u64;
    assert_eq!(h.ledger.balance(OWNER).await.unwrap(), charged);

    // Poll timeouts are transient: retried until attempts run out
    assert!(matches!(h.run_next().await, JobOutcome::Retrying { .. }));
    assert_eq!(h.task(&task).await.status, TaskStatus::Processing);
    assert!(matches!(h.run_next().await, JobOutcome::Retrying { .. }));
    assert_eq!(h.run_next().await, JobOutcome::Failed { refunded: true });

    let failed = h.task(&task).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.refunded);
    assert!(failed.error_message.unwrap().contains("not finished"));
    assert_eq!(h.ledger.balance(OWNER).await.unwrap(), OPENING_BALANCE);

    let last = h.events.events().pop().unwrap();
    assert!(matches!(last.kind, ProgressKind::Failed { will_retry: false, .. }));
}

#[tokio::test]
async fn test_transient_failure_resumes_from_checkpoints() {
    let h = Harness::new();
    let task = h.submit_segmented().await;

    // An earlier attempt already checkpointed segment 0
    let job = h.queue.dequeue("test-worker").await.unwrap().unwrap();
    h.store.apply(task.id, TaskUpdate::Start).await.unwrap();
    h.store
        .apply(
            task.id,
            TaskUpdate::SegmentDone(SegmentOutput {
                index: 0,
                audio_url: "file:///checkpointed.wav".into(),
                video_url: "file:///checkpointed.mp4".into(),
            }),
        )
        .await
        .unwrap();
    let artifacts = h.dir.path().join("artifacts").join(format!("tasks/{}/segments", task.id));
    std::fs::create_dir_all(&artifacts).unwrap();
    std::fs::write(artifacts.join("000.wav"), "WAV[First part.]").unwrap();
    std::fs::write(artifacts.join("000.mp4"), "MP4[000.wav]").unwrap();

    h.speech.failures.store(1, Ordering::SeqCst);
    let outcome = h.executor.handle_job(job, CancellationToken::new()).await;
    assert!(matches!(outcome, JobOutcome::Retrying { .. }));
    assert_eq!(h.task(&task).await.status, TaskStatus::Processing);

    assert_eq!(h.run_next().await, JobOutcome::Completed);

    // Segment 0 was never synthesized again
    let texts = h.speech.texts.lock().unwrap().clone();
    assert!(!texts.iter().any(|t| t == "First part."));
    assert!(texts.iter().any(|t| t == "Third part."));

    let done = h.task(&task).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.segment_outputs[0].video_url, "file:///checkpointed.mp4");
    assert_eq!(h.ledger.balance(OWNER).await.unwrap(), OPENING_BALANCE - task.cost.total as u64);
}

#[tokio::test]
async fn test_synthesis_failure_is_retried_once() {
    let h = Harness::new();
    h.video.set_mode(VideoMode::Fail);
    let task = h.submit_single().await;

    assert!(matches!(h.run_next().await, JobOutcome::Retrying { .. }));
    assert_eq!(h.run_next().await, JobOutcome::Failed { refunded: true });

    let failed = h.task(&task).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.error_message.unwrap().contains("face not detected"));
}

#[tokio::test]
async fn test_merge_timeout_fails_without_retry() {
    let h = Harness::new();
    h.media.merge_times_out.store(true, Ordering::SeqCst);
    let task = h.submit_segmented().await;

    assert_eq!(h.run_next().await, JobOutcome::Failed { refunded: true });

    let failed = h.task(&task).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.refunded);
    assert!(failed.error_message.unwrap().contains("timed out"));
    assert_eq!(h.ledger.balance(OWNER).await.unwrap(), OPENING_BALANCE);

    let job = h.queue.get(task.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt, 1);
    assert_eq!(h.media.merges.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_task_is_terminal() {
    let h = Harness::new();
    let id = TaskId::new();
    h.queue.enqueue(id, Priority::High).await.unwrap();

    assert_eq!(h.run_next().await, JobOutcome::Failed { refunded: false });
    let job = h.queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt, 1);
}

#[tokio::test]
async fn test_compensation_refunds_once() {
    let h = Harness::new();
    let task = h.submit_single().await;
    let total = task.cost.total;

    let first = compensate(&h.deps, task.id, "boom").await.unwrap();
    assert_eq!(first, Compensation::Refunded { amount: total });
    assert_eq!(h.ledger.balance(OWNER).await.unwrap(), OPENING_BALANCE);

    let second = compensate(&h.deps, task.id, "boom again").await.unwrap();
    assert_eq!(second, Compensation::NothingToRefund);
    assert_eq!(h.ledger.balance(OWNER).await.unwrap(), OPENING_BALANCE);

    // The ledger key alone also blocks a second credit
    assert!(!h.ledger.refund(OWNER, total, &refund_key(task.id)).await.unwrap());
}

#[tokio::test]
async fn test_compensation_skips_completed_task() {
    let h = Harness::new();
    let task = h.submit_single().await;
    h.run_next().await;

    let result = compensate(&h.deps, task.id, "late failure").await.unwrap();
    assert_eq!(result, Compensation::Skipped(TaskStatus::Completed));
    assert_eq!(h.task(&task).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_stalled_job_out_of_attempts_is_compensated() {
    let h = Harness::new();
    let queue = Arc::new(MemoryJobQueue::new(QueueConfig {
        max_attempts: 1,
        visibility_timeout: Duration::from_millis(5),
        ..Default::default()
    }));
    let deps = PipelineDeps {
        queue: queue.clone(),
        ..h.deps.clone()
    };
    let executor = JobExecutor::new(WorkerConfig::default(), TaskPipeline::new(deps, test_settings(h.dir.path())));

    let task = h.submit_single().await;
    queue.enqueue(task.id, Priority::Normal).await.unwrap();
    queue.dequeue("crashed-worker").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(executor.sweep_stalled().await.unwrap(), 1);
    let failed = h.task(&task).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.refunded);
    assert_eq!(h.ledger.balance(OWNER).await.unwrap(), OPENING_BALANCE);
}

#[tokio::test]
async fn test_run_drains_queue_until_shutdown() {
    let h = Harness::new();
    let first = h.submit_single().await;
    let second = h.submit_segmented().await;

    let shutdown = CancellationToken::new();
    let runner = {
        let executor = h.executor.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { executor.run(shutdown).await })
    };

    for _ in 0..200 {
        let a = h.task(&first).await.status;
        let b = h.task(&second).await.status;
        if a == TaskStatus::Completed && b == TaskStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    runner.await.unwrap().unwrap();

    assert_eq!(h.task(&first).await.status, TaskStatus::Completed);
    assert_eq!(h.task(&second).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_failed_compensation_is_finished_later() {
    let h = Harness::new();
    h.media.merge_times_out.store(true, Ordering::SeqCst);

    // Each compensation tries the failure write four times; the outage
    // outlasts the attempt and the first stall sweep.
    let store = Arc::new(FlakyStore {
        inner: h.store.clone(),
        failing_fails: AtomicU32::new(8),
    });
    let queue = Arc::new(MemoryJobQueue::new(QueueConfig {
        max_attempts: 1,
        visibility_timeout: Duration::from_millis(50),
        ..Default::default()
    }));
    let deps = PipelineDeps {
        store: store.clone(),
        queue: queue.clone(),
        ..h.deps.clone()
    };
    let executor = JobExecutor::new(WorkerConfig::default(), TaskPipeline::new(deps, test_settings(h.dir.path())));
    let task = h.submit_segmented().await;
    let charged = OPENING_BALANCE - task.cost.total as u64;
    queue.enqueue(task.id, Priority::Normal).await.unwrap();

    // The job stays leased while the task cannot be recorded as failed
    let job = queue.dequeue("test-worker").await.unwrap().unwrap();
    assert_eq!(executor.handle_job(job, CancellationToken::new()).await, JobOutcome::Unsettled);
    assert_eq!(h.task(&task).await.status, TaskStatus::Processing);
    assert_eq!(queue.get(task.id).await.unwrap().unwrap().state, JobState::Active);
    assert_eq!(h.ledger.balance(OWNER).await.unwrap(), charged);

    // Out of attempts and still unreachable: the sweeper puts the job back
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(executor.sweep_stalled().await.unwrap(), 1);
    let requeued = queue.get(task.id).await.unwrap().unwrap();
    assert_eq!(requeued.state, JobState::Waiting);
    assert_eq!(h.ledger.balance(OWNER).await.unwrap(), charged);

    // The store is back; the next attempt records the failure and refunds
    let job = queue.dequeue("test-worker").await.unwrap().unwrap();
    assert_eq!(
        executor.handle_job(job, CancellationToken::new()).await,
        JobOutcome::Failed { refunded: true }
    );
    let failed = h.task(&task).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.refunded);
    assert_eq!(h.ledger.balance(OWNER).await.unwrap(), OPENING_BALANCE);
    assert_eq!(queue.get(task.id).await.unwrap().unwrap().state, JobState::Failed);
}

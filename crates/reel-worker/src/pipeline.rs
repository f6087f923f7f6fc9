//! Text-to-video pipeline for one task.
//!
//! Segments are synthesized in index order (speech, then talking-head video),
//! each finished segment is checkpointed on the task record, and the segment
//! videos are merged into the final output. A retried job skips every segment
//! that already has a checkpoint.

use std::future::Future;
use std::path::{Path, PathBuf};

use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use reel_models::{
    segment_progress, Job, ProgressEvent, ProgressKind, Segment, SegmentOutput, Task, TaskId, TaskOutputs,
    TaskStatus, TaskUpdate, PROGRESS_MERGED,
};
use reel_storage::keys;
use reel_synth::{poll_until_done, SpeechRequest, VideoJobRequest};

use crate::context::{PipelineDeps, PipelineSettings};
use crate::error::{WorkerError, WorkerResult};
use crate::logging::TaskLogger;
use crate::metrics;

const AUDIO_CONTENT_TYPE: &str = "audio/wav";
const VIDEO_CONTENT_TYPE: &str = "video/mp4";
const THUMBNAIL_CONTENT_TYPE: &str = "image/jpeg";

/// Runs the generation pipeline for dequeued jobs.
#[derive(Clone)]
pub struct TaskPipeline {
    deps: PipelineDeps,
    settings: PipelineSettings,
}

impl TaskPipeline {
    pub fn new(deps: PipelineDeps, settings: PipelineSettings) -> Self {
        Self { deps, settings }
    }

    pub fn deps(&self) -> &PipelineDeps {
        &self.deps
    }

    /// Execute one attempt of `job`. Returns the outputs stored on the
    /// completed task.
    pub async fn execute(&self, job: &Job, cancel: &CancellationToken) -> WorkerResult<TaskOutputs> {
        let logger = TaskLogger::for_job(job);
        let task_id = job.task_id;

        let task = self
            .deps
            .store
            .get(task_id)
            .await?
            .ok_or(WorkerError::TaskNotFound(task_id))?;

        match task.status {
            // Completed by an earlier attempt whose ack was lost
            TaskStatus::Completed => return completed_outputs(&task),
            TaskStatus::Failed => {
                return Err(WorkerError::invalid_state(format!("task {task_id} already failed")));
            }
            TaskStatus::Pending | TaskStatus::Processing => {}
        }

        let task = self.deps.store.apply(task_id, TaskUpdate::Start).await?;
        let segments = task.work_segments();
        let total = segments.len() as u32;

        logger.log_start(segments.len());
        self.publish(ProgressEvent::new(task_id, ProgressKind::Started { segment_count: total }))
            .await;

        let pending: Vec<Segment> = segments
            .iter()
            .filter(|s| task.output_for(s.index).is_none())
            .cloned()
            .collect();
        let mut done = total - pending.len() as u32;
        if done > 0 {
            info!(task_id = %task_id, done, total, "Resuming from checkpointed segments");
        }

        let mut latest = task.clone();
        let parallelism = self.settings.segment_parallelism.max(1);
        let mut results = stream::iter(pending)
            .map(|segment| self.run_segment(&task, segment, cancel))
            .buffered(parallelism);

        while let Some(result) = results.next().await {
            let output = result?;
            let index = output.index;
            self.deps.store.apply(task_id, TaskUpdate::SegmentDone(output)).await?;
            done += 1;

            let pct = segment_progress(done, total);
            latest = self.deps.store.apply(task_id, TaskUpdate::Progress { pct }).await?;
            metrics::record_segment_synthesized();
            logger.log_segment(index, done, total);

            self.publish(ProgressEvent::new(
                task_id,
                ProgressKind::SegmentDone {
                    index,
                    completed: done,
                    total,
                },
            ))
            .await;
            self.publish(ProgressEvent::progress(task_id, pct)).await;
        }
        drop(results);

        let outputs: Vec<SegmentOutput> = segments
            .iter()
            .map(|s| {
                latest.output_for(s.index).cloned().ok_or_else(|| {
                    WorkerError::invalid_state(format!("segment {} has no checkpoint", s.index))
                })
            })
            .collect::<WorkerResult<_>>()?;

        tokio::fs::create_dir_all(&self.settings.work_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("task-{task_id}-"))
            .tempdir_in(&self.settings.work_dir)?;

        let (result, final_video_key) = match outputs.as_slice() {
            [single] => (
                TaskOutputs {
                    video_url: single.video_url.clone(),
                    audio_url: Some(single.audio_url.clone()),
                    thumbnail_url: None,
                },
                keys::segment_video(task_id, single.index),
            ),
            _ => (
                self.merge(task_id, &outputs, scratch.path(), cancel).await?,
                keys::final_video(task_id),
            ),
        };

        let thumbnail_url = self
            .thumbnail(task_id, &final_video_key, scratch.path())
            .await
            .unwrap_or_else(|e| {
                logger.log_warning(&format!("thumbnail skipped: {e}"));
                None
            });
        let result = TaskOutputs { thumbnail_url, ..result };

        self.deps
            .store
            .apply(task_id, TaskUpdate::Complete(result.clone()))
            .await?;
        self.publish(ProgressEvent::new(
            task_id,
            ProgressKind::Completed {
                video_url: result.video_url.clone(),
            },
        ))
        .await;
        logger.log_completion(&result.video_url);

        Ok(result)
    }

    /// Speech, video synthesis and artifact upload for one segment.
    async fn run_segment(
        &self,
        task: &Task,
        segment: Segment,
        cancel: &CancellationToken,
    ) -> WorkerResult<SegmentOutput> {
        let index = segment.index;
        debug!(task_id = %task.id, index, chars = segment.char_count, "Synthesizing segment");

        let request = SpeechRequest::new(segment.speech_text(), &task.voice, &task.voice_params);
        let audio = cancellable(cancel, self.deps.speech.synthesize(&request)).await??;
        if audio.is_empty() {
            return Err(WorkerError::synthesis_failed(format!(
                "speech service returned no audio for segment {index}"
            )));
        }

        let audio = self
            .deps
            .artifacts
            .put_bytes(&keys::segment_audio(task.id, index), audio.to_vec(), AUDIO_CONTENT_TYPE)
            .await?;

        let job = VideoJobRequest::new(audio.url.clone(), &task.template);
        let job_id = cancellable(cancel, self.deps.video.submit(&job)).await??;
        debug!(task_id = %task.id, index, job_id = %job_id, "Video job submitted");

        let finished = poll_until_done(self.deps.video.as_ref(), &job_id, self.settings.poll, cancel).await?;
        let video = cancellable(cancel, self.deps.video.download(&finished.video_url)).await??;

        let video = self
            .deps
            .artifacts
            .put_bytes(&keys::segment_video(task.id, index), video.to_vec(), VIDEO_CONTENT_TYPE)
            .await?;

        Ok(SegmentOutput {
            index,
            audio_url: audio.url,
            video_url: video.url,
        })
    }

    /// Join segment videos and audio into the final artifacts.
    async fn merge(
        &self,
        task_id: TaskId,
        outputs: &[SegmentOutput],
        scratch: &Path,
        cancel: &CancellationToken,
    ) -> WorkerResult<TaskOutputs> {
        let mut videos = Vec::with_capacity(outputs.len());
        let mut audios = Vec::with_capacity(outputs.len());

        for output in outputs {
            let video: PathBuf = scratch.join(format!("segment_{:03}.mp4", output.index));
            let audio: PathBuf = scratch.join(format!("segment_{:03}.wav", output.index));
            self.deps
                .artifacts
                .get_to_file(&keys::segment_video(task_id, output.index), &video)
                .await?;
            self.deps
                .artifacts
                .get_to_file(&keys::segment_audio(task_id, output.index), &audio)
                .await?;
            videos.push(video);
            audios.push(audio);
        }

        let merged = self
            .deps
            .media
            .merge_videos(&videos, &scratch.join("final.mp4"), cancel)
            .await?;
        info!(
            task_id = %task_id,
            segments = outputs.len(),
            duration_secs = merged.duration_secs,
            size_bytes = merged.size_bytes,
            "Merged segment videos"
        );

        let final_audio = scratch.join("final.wav");
        self.deps.media.concat_audio(&audios, &final_audio, cancel).await?;

        let video = self
            .deps
            .artifacts
            .put_file(&keys::final_video(task_id), &merged.path, VIDEO_CONTENT_TYPE)
            .await?;
        let audio = self
            .deps
            .artifacts
            .put_file(&keys::final_audio(task_id), &final_audio, AUDIO_CONTENT_TYPE)
            .await?;

        self.deps
            .store
            .apply(task_id, TaskUpdate::Progress { pct: PROGRESS_MERGED })
            .await?;
        self.publish(ProgressEvent::new(task_id, ProgressKind::Merged)).await;
        self.publish(ProgressEvent::progress(task_id, PROGRESS_MERGED)).await;

        Ok(TaskOutputs {
            video_url: video.url,
            audio_url: Some(audio.url),
            thumbnail_url: None,
        })
    }

    async fn thumbnail(&self, task_id: TaskId, video_key: &str, scratch: &Path) -> WorkerResult<Option<String>> {
        let video = scratch.join("thumb_source.mp4");
        if !video.exists() {
            self.deps.artifacts.get_to_file(video_key, &video).await?;
        }
        let image = scratch.join("thumb.jpg");
        self.deps.media.thumbnail(&video, &image).await?;

        let stored = self
            .deps
            .artifacts
            .put_file(&keys::thumbnail(task_id), &image, THUMBNAIL_CONTENT_TYPE)
            .await?;
        Ok(Some(stored.url))
    }

    async fn publish(&self, event: ProgressEvent) {
        if let Err(e) = self.deps.progress.publish(&event).await {
            warn!(task_id = %event.task_id, "Failed to publish progress event: {}", e);
        }
    }
}

fn completed_outputs(task: &Task) -> WorkerResult<TaskOutputs> {
    let video_url = task
        .result_video_url
        .clone()
        .ok_or_else(|| WorkerError::invalid_state(format!("completed task {} has no video", task.id)))?;
    Ok(TaskOutputs {
        video_url,
        audio_url: task.result_audio_url.clone(),
        thumbnail_url: task.thumbnail_url.clone(),
    })
}

/// Race a service call against job cancellation.
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> WorkerResult<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => Err(WorkerError::transient("job cancelled")),
        output = fut => Ok(output),
    }
}

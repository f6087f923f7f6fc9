//! Media operations behind a trait so the pipeline can run without FFmpeg.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::command::{check_ffmpeg, check_ffprobe, FfmpegRunner};
use crate::config::{MediaConfig, MergeOptions};
use crate::error::MediaResult;
use crate::merge::{concat_audio, merge_videos, MergeOutput};
use crate::probe::get_duration;
use crate::thumbnail::{generate_thumbnail, thumbnail_timestamp};

#[async_trait]
pub trait MediaProcessor: Send + Sync {
    /// Merge segment videos in order.
    async fn merge_videos(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        cancel: &CancellationToken,
    ) -> MediaResult<MergeOutput>;

    /// Concatenate segment audio in order.
    async fn concat_audio(&self, inputs: &[PathBuf], output: &Path, cancel: &CancellationToken) -> MediaResult<()>;

    /// Extract a JPEG thumbnail.
    async fn thumbnail(&self, video: &Path, output: &Path) -> MediaResult<()>;
}

/// [`MediaProcessor`] that shells out to the FFmpeg CLI.
#[derive(Debug, Clone)]
pub struct FfmpegMediaProcessor {
    config: MediaConfig,
}

impl FfmpegMediaProcessor {
    /// Fails if `ffmpeg` or `ffprobe` is missing from `PATH`.
    pub fn new(config: MediaConfig) -> MediaResult<Self> {
        let ffmpeg = check_ffmpeg()?;
        let ffprobe = check_ffprobe()?;
        tracing::info!(ffmpeg = %ffmpeg.display(), ffprobe = %ffprobe.display(), "Found FFmpeg tools");
        Ok(Self { config })
    }

    pub fn merge_options(&self) -> &MergeOptions {
        &self.config.merge
    }

    fn runner(&self, cancel: &CancellationToken) -> FfmpegRunner {
        FfmpegRunner::new()
            .with_timeout(self.config.ffmpeg_timeout)
            .with_cancel(cancel.clone())
    }
}

#[async_trait]
impl MediaProcessor for FfmpegMediaProcessor {
    async fn merge_videos(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        cancel: &CancellationToken,
    ) -> MediaResult<MergeOutput> {
        merge_videos(&self.runner(cancel), inputs, output, &self.config.merge).await
    }

    async fn concat_audio(&self, inputs: &[PathBuf], output: &Path, cancel: &CancellationToken) -> MediaResult<()> {
        concat_audio(&self.runner(cancel), inputs, output).await
    }

    async fn thumbnail(&self, video: &Path, output: &Path) -> MediaResult<()> {
        let at = thumbnail_timestamp(get_duration(video).await.unwrap_or(0.0));
        let runner = FfmpegRunner::new().with_timeout(self.config.ffmpeg_timeout);
        generate_thumbnail(&runner, video, output, at).await
    }
}

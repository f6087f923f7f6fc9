//! Talking-head video synthesis client and bounded polling.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{check_status, ServiceHttp};
use crate::config::SynthConfig;
use crate::error::{SynthError, SynthResult};
use crate::types::{SubmitResponse, VideoJobOutput, VideoJobRequest, VideoJobStatus};

/// Audio + template to video, as an asynchronous remote job.
#[async_trait]
pub trait VideoSynthesizer: Send + Sync {
    /// Submit a job. Returns the remote job id.
    async fn submit(&self, request: &VideoJobRequest) -> SynthResult<String>;

    async fn status(&self, job_id: &str) -> SynthResult<VideoJobStatus>;

    /// Fetch a finished output.
    async fn download(&self, url: &str) -> SynthResult<Bytes>;
}

/// HTTP client for the video service (`/v1/jobs`).
pub struct HttpVideoClient {
    service: ServiceHttp,
}

impl HttpVideoClient {
    pub fn new(config: &SynthConfig) -> SynthResult<Self> {
        Ok(Self {
            service: ServiceHttp::new(&config.video_url, config.request_timeout, config.max_retries)?,
        })
    }

    pub async fn health_check(&self) -> bool {
        self.service.health_check().await
    }
}

#[async_trait]
impl VideoSynthesizer for HttpVideoClient {
    async fn submit(&self, request: &VideoJobRequest) -> SynthResult<String> {
        let url = self.service.url("v1/jobs")?;

        let submitted: SubmitResponse = self
            .service
            .with_retry(|| async {
                let response = self
                    .service
                    .http
                    .post(url.clone())
                    .json(request)
                    .send()
                    .await?;
                let response = check_status(response).await?;
                Ok::<_, SynthError>(response.json().await?)
            })
            .await?;

        if submitted.job_id.is_empty() {
            return Err(SynthError::InvalidResponse("empty job id".into()));
        }
        debug!(job_id = %submitted.job_id, template_id = %request.template_id, "Submitted video job");
        Ok(submitted.job_id)
    }

    async fn status(&self, job_id: &str) -> SynthResult<VideoJobStatus> {
        let url = self.service.url(&format!("v1/jobs/{}", job_id))?;
        self.service
            .with_retry(|| async {
                let response = self.service.http.get(url.clone()).send().await?;
                let response = check_status(response).await?;
                Ok::<_, SynthError>(response.json().await?)
            })
            .await
    }

    async fn download(&self, output: &str) -> SynthResult<Bytes> {
        // Outputs may be absolute or relative to the service
        let url = match url::Url::parse(output) {
            Ok(url) => url,
            Err(_) => self.service.url(output)?,
        };
        self.service
            .with_retry(|| async {
                let response = self.service.http.get(url.clone()).send().await?;
                let response = check_status(response).await?;
                Ok::<_, SynthError>(response.bytes().await?)
            })
            .await
    }
}

/// Poll settings for [`poll_until_done`].
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn from_config(config: &SynthConfig) -> Self {
        Self {
            interval: config.poll_interval,
            timeout: config.poll_timeout,
        }
    }
}

/// Poll a video job at a fixed interval until it completes, fails, times out
/// or is cancelled.
pub async fn poll_until_done(
    synth: &dyn VideoSynthesizer,
    job_id: &str,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> SynthResult<VideoJobOutput> {
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut polls = 0u32;

    loop {
        let status = synth.status(job_id).await?;
        polls += 1;

        if status.failed {
            return Err(SynthError::JobFailed {
                job_id: job_id.to_string(),
                message: status.error.unwrap_or_else(|| "no error reported".to_string()),
            });
        }
        if status.completed {
            let video_url = status.outputs.into_iter().next().ok_or_else(|| {
                SynthError::InvalidResponse(format!("job {} completed without outputs", job_id))
            })?;
            info!(job_id, polls, elapsed_ms = started.elapsed().as_millis() as u64, "Video job completed");
            return Ok(VideoJobOutput {
                job_id: job_id.to_string(),
                video_url,
            });
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(SynthError::PollTimeout {
                job_id: job_id.to_string(),
                waited_secs: policy.timeout.as_secs(),
            });
        }
        let wake = (now + policy.interval).min(deadline);

        tokio::select! {
            _ = cancel.cancelled() => return Err(SynthError::Cancelled),
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}

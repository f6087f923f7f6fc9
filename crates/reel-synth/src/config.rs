//! Synthesis client configuration.

use std::time::Duration;

use url::Url;

use crate::error::{SynthError, SynthResult};

#[derive(Debug, Clone)]
pub struct SynthConfig {
    /// Base URL of the speech service
    pub speech_url: String,
    /// Base URL of the video service
    pub video_url: String,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
    /// Delay between video job status checks
    pub poll_interval: Duration,
    /// Longest wait for a video job
    pub poll_timeout: Duration,
    /// Retries for transient request errors inside one call
    pub max_retries: u32,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            speech_url: "http://localhost:8010".to_string(),
            video_url: "http://localhost:8020".to_string(),
            request_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(900),
            max_retries: 2,
        }
    }
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default),
    )
}

impl SynthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            speech_url: std::env::var("SPEECH_SERVICE_URL").unwrap_or(defaults.speech_url),
            video_url: std::env::var("VIDEO_SERVICE_URL").unwrap_or(defaults.video_url),
            request_timeout: env_secs("SYNTH_REQUEST_TIMEOUT", 120),
            poll_interval: env_secs("VIDEO_POLL_INTERVAL", 5),
            poll_timeout: env_secs("VIDEO_POLL_TIMEOUT", 900),
            max_retries: std::env::var("SYNTH_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
        }
    }

    /// Reject malformed service URLs before any request is made.
    pub fn validate(&self) -> SynthResult<()> {
        for (name, value) in [("speech", &self.speech_url), ("video", &self.video_url)] {
            Url::parse(value)
                .map_err(|e| SynthError::Config(format!("{} service URL {:?}: {}", name, value, e)))?;
        }
        if self.poll_interval.is_zero() {
            return Err(SynthError::Config("poll interval must be positive".into()));
        }
        Ok(())
    }
}

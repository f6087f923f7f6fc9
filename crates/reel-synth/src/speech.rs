//! Speech synthesis client.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::client::{check_status, ServiceHttp};
use crate::config::SynthConfig;
use crate::error::{SynthError, SynthResult};
use crate::types::SpeechRequest;

/// Text to audio.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize one segment. Returns the encoded audio.
    async fn synthesize(&self, request: &SpeechRequest) -> SynthResult<Bytes>;
}

/// HTTP client for the speech service (`POST /v1/tts`).
pub struct HttpSpeechClient {
    service: ServiceHttp,
}

impl HttpSpeechClient {
    pub fn new(config: &SynthConfig) -> SynthResult<Self> {
        Ok(Self {
            service: ServiceHttp::new(&config.speech_url, config.request_timeout, config.max_retries)?,
        })
    }

    pub async fn health_check(&self) -> bool {
        self.service.health_check().await
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechClient {
    async fn synthesize(&self, request: &SpeechRequest) -> SynthResult<Bytes> {
        let url = self.service.url("v1/tts")?;
        debug!(chars = request.text.chars().count(), voice_id = %request.voice_id, "Requesting speech");

        let audio = self
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
                Ok::<_, SynthError>(response.bytes().await?)
            })
            .await?;

        if audio.is_empty() {
            return Err(SynthError::InvalidResponse("speech service returned no audio".into()));
        }
        Ok(audio)
    }
}

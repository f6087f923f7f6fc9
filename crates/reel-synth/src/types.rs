//! Synthesis service request/response types.

use serde::{Deserialize, Serialize};

use reel_models::{TemplateRef, VoiceParams, VoiceRef};

/// Request body for `POST /v1/tts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    pub voice_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_audio_url: Option<String>,
    /// Emotion intensities in the service's fixed axis order
    pub emotion_vector: [f32; 8],
    pub emotion_alpha: f32,
    pub pitch_scale: f32,
    pub speed_scale: f32,
}

impl SpeechRequest {
    pub fn new(text: impl Into<String>, voice: &VoiceRef, params: &VoiceParams) -> Self {
        Self {
            text: text.into(),
            voice_id: voice.voice_id.clone(),
            reference_audio_url: voice.reference_audio_url.clone(),
            emotion_vector: params.emotion.to_vector(),
            emotion_alpha: params.emotion_alpha.clamp(0.0, 1.0),
            pitch_scale: params.pitch_scale,
            speed_scale: params.speed_scale,
        }
    }
}

/// Request body for `POST /v1/jobs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoJobRequest {
    pub audio_url: String,
    pub template_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_video_url: Option<String>,
}

impl VideoJobRequest {
    pub fn new(audio_url: impl Into<String>, template: &TemplateRef) -> Self {
        Self {
            audio_url: audio_url.into(),
            template_id: template.template_id.clone(),
            template_video_url: template.video_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SubmitResponse {
    pub job_id: String,
}

/// Body of `GET /v1/jobs/{job_id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoJobStatus {
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub failed: bool,
    /// Output URLs; the first one is the rendered video
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VideoJobStatus {
    pub fn is_finished(&self) -> bool {
        self.completed || self.failed
    }
}

/// A finished video job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoJobOutput {
    pub job_id: String,
    pub video_url: String,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: Option<String>,
}

//! Voice selection and emotion parameters for speech synthesis.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Axis order of the speech service's emotion vector.
pub const EMOTION_AXES: [&str; 8] = [
    "happy",
    "angry",
    "sad",
    "afraid",
    "disgusted",
    "melancholic",
    "surprised",
    "calm",
];

/// Reference to the voice used for narration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VoiceRef {
    pub voice_id: String,
    /// Reference clip for cloned voices
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_audio_url: Option<String>,
    #[serde(default)]
    pub is_custom: bool,
}

impl VoiceRef {
    pub fn preset(voice_id: impl Into<String>) -> Self {
        Self {
            voice_id: voice_id.into(),
            reference_audio_url: None,
            is_custom: false,
        }
    }
}

/// Four-axis emotion intensity, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Emotion {
    #[serde(default)]
    pub happiness: f32,
    #[serde(default)]
    pub anger: f32,
    #[serde(default)]
    pub sadness: f32,
    #[serde(default)]
    pub surprise: f32,
}

impl Emotion {
    pub fn neutral() -> Self {
        Self::default()
    }

    /// Map onto the 8-slot vector in [`EMOTION_AXES`] order.
    ///
    /// `calm` is the complement of happiness; axes without a counterpart stay 0.
    pub fn to_vector(&self) -> [f32; 8] {
        let happy = clamp_unit(self.happiness);
        [
            happy,
            clamp_unit(self.anger),
            clamp_unit(self.sadness),
            0.0,
            0.0,
            0.0,
            clamp_unit(self.surprise),
            clamp_unit(1.0 - happy),
        ]
    }

    pub fn is_in_range(&self) -> bool {
        [self.happiness, self.anger, self.sadness, self.surprise]
            .iter()
            .all(|v| (0.0..=1.0).contains(v))
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Prosody and emotion parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VoiceParams {
    #[serde(default)]
    pub emotion: Emotion,
    #[serde(default = "default_emotion_alpha")]
    pub emotion_alpha: f32,
    #[serde(default = "default_scale")]
    pub pitch_scale: f32,
    #[serde(default = "default_scale")]
    pub speed_scale: f32,
}

fn default_emotion_alpha() -> f32 {
    0.6
}

fn default_scale() -> f32 {
    1.0
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            emotion: Emotion::neutral(),
            emotion_alpha: default_emotion_alpha(),
            pitch_scale: default_scale(),
            speed_scale: default_scale(),
        }
    }
}

impl VoiceParams {
    pub fn emotion_vector(&self) -> [f32; 8] {
        self.emotion.to_vector()
    }
}

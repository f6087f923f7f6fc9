//! Media processing configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MediaError;

/// How consecutive segment videos are joined.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Transition {
    /// Hard cut
    #[default]
    None,
    /// Cross-fade of video and audio
    Fade { secs: f64 },
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Fade { secs } => write!(f, "fade:{}", secs),
        }
    }
}

impl FromStr for Transition {
    type Err = MediaError;

    /// `none`, `fade` (0.5 s) or `fade:<secs>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.split_once(':') {
            None if s == "none" || s.is_empty() => Ok(Self::None),
            None if s == "fade" => Ok(Self::Fade { secs: 0.5 }),
            Some(("fade", secs)) => match secs.parse::<f64>() {
                Ok(secs) if secs > 0.0 && secs.is_finite() => Ok(Self::Fade { secs }),
                _ => Err(MediaError::Config(format!("invalid fade duration {:?}", secs))),
            },
            _ => Err(MediaError::Config(format!("unknown transition {:?}", s))),
        }
    }
}

/// Output format of merged videos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOptions {
    pub transition: Transition,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// e.g. "2500k"
    pub video_bitrate: String,
    pub audio_bitrate: String,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            transition: Transition::None,
            width: 1280,
            height: 720,
            fps: 25,
            video_bitrate: "2500k".to_string(),
            audio_bitrate: "128k".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub merge: MergeOptions,
    /// Upper bound for a single FFmpeg invocation
    pub ffmpeg_timeout: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            merge: MergeOptions::default(),
            ffmpeg_timeout: Duration::from_secs(1800),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl MediaConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, MediaError> {
        let defaults = MergeOptions::default();
        let transition = match std::env::var("MEDIA_TRANSITION") {
            Ok(value) => value.parse()?,
            Err(_) => Transition::None,
        };
        Ok(Self {
            merge: MergeOptions {
                transition,
                width: env_parse("MEDIA_OUTPUT_WIDTH").unwrap_or(defaults.width),
                height: env_parse("MEDIA_OUTPUT_HEIGHT").unwrap_or(defaults.height),
                fps: env_parse("MEDIA_OUTPUT_FPS").unwrap_or(defaults.fps),
                video_bitrate: std::env::var("MEDIA_VIDEO_BITRATE").unwrap_or(defaults.video_bitrate),
                audio_bitrate: std::env::var("MEDIA_AUDIO_BITRATE").unwrap_or(defaults.audio_bitrate),
            },
            ffmpeg_timeout: Duration::from_secs(env_parse("MEDIA_FFMPEG_TIMEOUT").unwrap_or(1800)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transition() {
        assert_eq!("none".parse::<Transition>().unwrap(), Transition::None);
        assert_eq!("Fade".parse::<Transition>().unwrap(), Transition::Fade { secs: 0.5 });
        assert_eq!("fade:1.25".parse::<Transition>().unwrap(), Transition::Fade { secs: 1.25 });
        assert!("fade:-1".parse::<Transition>().is_err());
        assert!("wipe".parse::<Transition>().is_err());
    }
}

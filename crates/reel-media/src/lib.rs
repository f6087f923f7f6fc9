//! FFmpeg CLI wrapper for merging narrated video segments.
//!
//! Provides a typed FFmpeg command builder, progress parsing from
//! `-progress pipe:2`, cancellation and timeouts, ordered merging with hard
//! cuts or cross-fades, audio concatenation, probing and thumbnails.

pub mod command;
pub mod config;
pub mod error;
pub mod merge;
pub mod probe;
pub mod processor;
pub mod progress;
pub mod thumbnail;

pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use config::{MediaConfig, MergeOptions, Transition};
pub use error::{MediaError, MediaResult};
pub use merge::{concat_audio, merge_videos, MergeOutput};
pub use probe::{get_duration, probe_media, MediaInfo};
pub use processor::{FfmpegMediaProcessor, MediaProcessor};
pub use progress::FfmpegProgress;
pub use thumbnail::generate_thumbnail;

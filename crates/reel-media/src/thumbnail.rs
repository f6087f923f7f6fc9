//! Thumbnail generation.

use std::path::Path;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::MediaResult;

/// Thumbnail width; height keeps the aspect ratio.
pub const THUMBNAIL_SCALE_WIDTH: u32 = 480;

/// Frame position used for thumbnails.
pub const THUMBNAIL_TIMESTAMP_SECS: f64 = 1.0;

/// Seek position for a video of `duration` seconds.
pub fn thumbnail_timestamp(duration: f64) -> f64 {
    if duration > 0.0 && duration < 2.0 * THUMBNAIL_TIMESTAMP_SECS {
        duration / 2.0
    } else {
        THUMBNAIL_TIMESTAMP_SECS
    }
}

/// Build the thumbnail extraction command.
pub fn thumbnail_command(video_path: &Path, output_path: &Path, at_secs: f64) -> FfmpegCommand {
    FfmpegCommand::new(output_path)
        .input_with_args(video_path, ["-ss".to_string(), format!("{:.3}", at_secs)])
        .single_frame()
        .video_filter(format!("scale={}:-2", THUMBNAIL_SCALE_WIDTH))
}

/// Generate a JPEG thumbnail from a video file.
pub async fn generate_thumbnail(
    runner: &FfmpegRunner,
    video_path: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    at_secs: f64,
) -> MediaResult<()> {
    let cmd = thumbnail_command(video_path.as_ref(), output_path.as_ref(), at_secs);
    runner.run(&cmd).await
}

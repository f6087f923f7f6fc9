//! Segment video merging and audio concatenation.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::config::{MergeOptions, Transition};
use crate::error::{MediaError, MediaResult};
use crate::probe::probe_media;

/// Shortest cross-fade worth rendering.
const MIN_FADE_SECS: f64 = 0.04;

/// Result of a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutput {
    pub path: PathBuf,
    pub duration_secs: f64,
    pub size_bytes: u64,
}

/// Scale/pad every input to the target frame and resample its audio so the
/// streams can be joined.
fn normalize_inputs(count: usize, opts: &MergeOptions) -> String {
    let (w, h) = (opts.width, opts.height);
    let mut graph = String::new();
    for i in 0..count {
        let _ = write!(
            graph,
            "[{i}:v]scale={w}:{h}:force_original_aspect_ratio=decrease,\
             pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={fps},format=yuv420p[v{i}];\
             [{i}:a]aresample=48000,aformat=channel_layouts=stereo[a{i}];",
            fps = opts.fps
        );
    }
    graph
}

/// Filter graph joining `count` inputs with hard cuts. Outputs `[vout]` and `[aout]`.
pub fn concat_filter(count: usize, opts: &MergeOptions) -> String {
    let mut graph = normalize_inputs(count, opts);
    for i in 0..count {
        let _ = write!(graph, "[v{i}][a{i}]");
    }
    let _ = write!(graph, "concat=n={count}:v=1:a=1[vout][aout]");
    graph
}

/// Filter graph cross-fading consecutive inputs. Outputs `[vout]` and `[aout]`.
///
/// The fade that joins input `k` starts at `sum(durations[..k]) - k * fade`,
/// the end of the stream merged so far minus one fade.
pub fn xfade_filter(durations: &[f64], fade: f64, opts: &MergeOptions) -> String {
    let count = durations.len();
    let mut graph = normalize_inputs(count, opts);
    let mut elapsed = 0.0;
    let mut prev_v = "v0".to_string();
    let mut prev_a = "a0".to_string();

    for k in 1..count {
        elapsed += durations[k - 1];
        let offset = (elapsed - k as f64 * fade).max(0.0);
        let (next_v, next_a) = if k == count - 1 {
            ("vout".to_string(), "aout".to_string())
        } else {
            (format!("vx{k}"), format!("ax{k}"))
        };
        let _ = write!(
            graph,
            "[{prev_v}][v{k}]xfade=transition=fade:duration={fade:.3}:offset={offset:.3}[{next_v}];\
             [{prev_a}][a{k}]acrossfade=d={fade:.3}[{next_a}]"
        );
        if k != count - 1 {
            graph.push(';');
        }
        prev_v = next_v;
        prev_a = next_a;
    }
    graph
}

/// Fade length that fits every clip, or `None` to fall back to hard cuts.
pub fn effective_fade(requested: f64, durations: &[f64]) -> Option<f64> {
    let shortest = durations.iter().copied().fold(f64::INFINITY, f64::min);
    let fade = requested.min(shortest / 2.0);
    (fade >= MIN_FADE_SECS).then_some(fade)
}

fn ensure_inputs(inputs: &[PathBuf]) -> MediaResult<()> {
    if inputs.is_empty() {
        return Err(MediaError::NoInputs);
    }
    if let Some(missing) = inputs.iter().find(|p| !p.exists()) {
        return Err(MediaError::FileNotFound(missing.clone()));
    }
    Ok(())
}

async fn finish(output: &Path) -> MediaResult<MergeOutput> {
    let info = probe_media(output).await?;
    let size_bytes = tokio::fs::metadata(output).await?.len();
    Ok(MergeOutput {
        path: output.to_path_buf(),
        duration_secs: info.duration,
        size_bytes,
    })
}

/// Merge segment videos, in the given order, into `output`.
///
/// A single input is copied unchanged.
pub async fn merge_videos(
    runner: &FfmpegRunner,
    inputs: &[PathBuf],
    output: &Path,
    opts: &MergeOptions,
) -> MediaResult<MergeOutput> {
    ensure_inputs(inputs)?;

    if inputs.len() == 1 {
        tokio::fs::copy(&inputs[0], output).await?;
        return finish(output).await;
    }

    let filter = match opts.transition {
        Transition::None => concat_filter(inputs.len(), opts),
        Transition::Fade { secs } => {
            let mut durations = Vec::with_capacity(inputs.len());
            for input in inputs {
                durations.push(probe_media(input).await?.duration);
            }
            match effective_fade(secs, &durations) {
                Some(fade) => xfade_filter(&durations, fade, opts),
                None => {
                    debug!("Segments too short for a {}s fade, using hard cuts", secs);
                    concat_filter(inputs.len(), opts)
                }
            }
        }
    };

    let cmd = inputs
        .iter()
        .fold(FfmpegCommand::new(output), |cmd, input| cmd.input(input))
        .filter_complex(filter)
        .map("[vout]")
        .map("[aout]")
        .video_codec("libx264")
        .output_args(["-preset", "veryfast"])
        .video_bitrate(&opts.video_bitrate)
        .audio_codec("aac")
        .audio_bitrate(&opts.audio_bitrate)
        .output_args(["-movflags", "+faststart"]);

    runner.run(&cmd).await?;
    let merged = finish(output).await?;
    info!(
        inputs = inputs.len(),
        transition = %opts.transition,
        duration_secs = merged.duration_secs,
        size_bytes = merged.size_bytes,
        "Merged segment videos"
    );
    Ok(merged)
}

/// Body of an FFmpeg concat-demuxer list file.
pub fn concat_list(inputs: &[PathBuf]) -> String {
    inputs
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', r"'\''")))
        .collect()
}

/// Concatenate audio files, in order, into a WAV file.
pub async fn concat_audio(runner: &FfmpegRunner, inputs: &[PathBuf], output: &Path) -> MediaResult<()> {
    ensure_inputs(inputs)?;

    if inputs.len() == 1 {
        tokio::fs::copy(&inputs[0], output).await?;
        return Ok(());
    }

    let list_dir = output.parent().unwrap_or_else(|| Path::new("."));
    let mut list = tempfile::Builder::new()
        .prefix("concat-")
        .suffix(".txt")
        .tempfile_in(list_dir)?;
    list.write_all(concat_list(inputs).as_bytes())?;
    list.flush()?;

    let cmd = FfmpegCommand::new(output)
        .input_with_args(list.path(), ["-f", "concat", "-safe", "0"])
        .audio_codec("pcm_s16le");

    runner.run(&cmd).await
}

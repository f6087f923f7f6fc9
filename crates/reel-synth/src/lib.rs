//! Clients for the external synthesis services.
//!
//! The speech service turns a segment of text into audio. The video service
//! renders a talking-head clip from that audio and a template, as a remote job
//! that is polled until it finishes.

mod client;
pub mod config;
pub mod error;
pub mod speech;
pub mod types;
pub mod video;

pub use config::SynthConfig;
pub use error::{SynthError, SynthResult};
pub use speech::{HttpSpeechClient, SpeechSynthesizer};
pub use types::{SpeechRequest, VideoJobOutput, VideoJobRequest, VideoJobStatus};
pub use video::{poll_until_done, HttpVideoClient, PollPolicy, VideoSynthesizer};

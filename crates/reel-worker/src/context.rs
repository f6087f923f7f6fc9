//! Collaborators shared by every job.

use std::path::PathBuf;
use std::sync::Arc;

use reel_media::MediaProcessor;
use reel_queue::{JobQueue, ProgressPublisher};
use reel_storage::ArtifactStore;
use reel_store::{CreditLedger, TaskStore};
use reel_synth::{PollPolicy, SpeechSynthesizer, VideoSynthesizer};

/// External systems a job talks to.
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Arc<dyn TaskStore>,
    pub ledger: Arc<dyn CreditLedger>,
    pub queue: Arc<dyn JobQueue>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub speech: Arc<dyn SpeechSynthesizer>,
    pub video: Arc<dyn VideoSynthesizer>,
    pub media: Arc<dyn MediaProcessor>,
    pub progress: Arc<dyn ProgressPublisher>,
}

/// Per-job tuning.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub poll: PollPolicy,
    /// Segments in flight at once (index order is kept)
    pub segment_parallelism: usize,
    /// Parent of per-task scratch directories
    pub work_dir: PathBuf,
}

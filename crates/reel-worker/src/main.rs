//! Generation worker binary.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use reel_media::{FfmpegMediaProcessor, MediaConfig};
use reel_queue::{ProgressChannel, QueueConfig, RedisJobQueue};
use reel_storage::{ArtifactStore, LocalArtifactStore, R2Client};
use reel_store::{RedisCreditLedger, RedisTaskStore, StoreConfig};
use reel_synth::{HttpSpeechClient, HttpVideoClient, PollPolicy, SynthConfig};
use reel_worker::metrics::init_metrics;
use reel_worker::{JobExecutor, PipelineDeps, PipelineSettings, TaskPipeline, WorkerConfig};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        eprintln!("rustls crypto provider was already installed");
    }

    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting reel-worker");

    if let Err(e) = run().await {
        error!("Worker failed: {:#}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,reel=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

async fn artifact_store() -> anyhow::Result<Arc<dyn ArtifactStore>> {
    if std::env::var("R2_ENDPOINT_URL").is_ok() {
        let client = R2Client::from_env().await.context("R2 configuration")?;
        if let Err(e) = client.check_connectivity().await {
            warn!("R2 not reachable yet: {}", e);
        }
        info!("Storing artifacts in R2");
        Ok(Arc::new(client))
    } else {
        let local = LocalArtifactStore::from_env().context("local artifact directory")?;
        info!("Storing artifacts under {}", local.root().display());
        Ok(Arc::new(local))
    }
}

async fn run() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    init_metrics(config.metrics_port).context("metrics exporter")?;

    let queue_config = QueueConfig::from_env();
    let progress = ProgressChannel::new(&queue_config.redis_url, queue_config.prefix.clone())
        .context("progress channel")?;
    let queue = RedisJobQueue::new(queue_config).context("job queue")?;
    if let Err(e) = queue.ping().await {
        warn!("Redis not reachable yet: {}", e);
    }

    let store_config = StoreConfig::from_env();
    let store = RedisTaskStore::new(store_config.clone()).context("task store")?;
    let ledger = RedisCreditLedger::new(store_config).context("credit ledger")?;

    let synth_config = SynthConfig::from_env();
    synth_config.validate().context("synthesis configuration")?;
    let speech = HttpSpeechClient::new(&synth_config).context("speech client")?;
    let video = HttpVideoClient::new(&synth_config).context("video client")?;
    if !speech.health_check().await {
        warn!("Speech service health check failed");
    }
    if !video.health_check().await {
        warn!("Video service health check failed");
    }

    let media = FfmpegMediaProcessor::new(MediaConfig::from_env()?).context("ffmpeg")?;

    let deps = PipelineDeps {
        store: Arc::new(store),
        ledger: Arc::new(ledger),
        queue: Arc::new(queue),
        artifacts: artifact_store().await?,
        speech: Arc::new(speech),
        video: Arc::new(video),
        media: Arc::new(media),
        progress: Arc::new(progress),
    };
    let settings = PipelineSettings {
        poll: PollPolicy::from_config(&synth_config),
        segment_parallelism: config.segment_parallelism,
        work_dir: config.work_dir.clone(),
    };

    let executor = JobExecutor::new(config, TaskPipeline::new(deps, settings));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Received shutdown signal");
            shutdown.cancel();
        }
    });

    executor.run(shutdown).await?;
    Ok(())
}

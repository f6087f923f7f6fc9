//! Application state.

use std::sync::Arc;

use anyhow::Context;

use reel_queue::{JobQueue, QueueConfig, RedisJobQueue};
use reel_storage::{ArtifactStore, LocalArtifactStore, R2Client};
use reel_store::{CreditLedger, RedisCreditLedger, RedisTaskStore, StoreConfig, TaskStore};

use crate::config::ApiConfig;
use crate::services::SubmissionService;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub store: Arc<dyn TaskStore>,
    pub queue: Arc<dyn JobQueue>,
    pub submissions: SubmissionService,
}

impl AppState {
    /// Assemble state from already-built collaborators.
    pub fn new(
        config: ApiConfig,
        store: Arc<dyn TaskStore>,
        ledger: Arc<dyn CreditLedger>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let submissions = SubmissionService::new(
            Arc::clone(&store),
            ledger,
            Arc::clone(&queue),
            config.cost_rates,
            config.max_text_chars,
        );
        Self {
            config,
            store,
            queue,
            submissions,
        }
    }

    /// Also delete stored artifacts together with their task.
    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.submissions = self.submissions.with_artifacts(artifacts);
        self
    }

    /// Connect to Redis and the artifact store from the environment.
    pub async fn from_env(config: ApiConfig) -> anyhow::Result<Self> {
        let queue = RedisJobQueue::new(QueueConfig::from_env()).context("job queue")?;
        let store_config = StoreConfig::from_env();
        let store = RedisTaskStore::new(store_config.clone()).context("task store")?;
        let ledger = RedisCreditLedger::new(store_config).context("credit ledger")?;

        let artifacts: Arc<dyn ArtifactStore> = if std::env::var("R2_ENDPOINT_URL").is_ok() {
            Arc::new(R2Client::from_env().await.context("R2 configuration")?)
        } else {
            Arc::new(LocalArtifactStore::from_env().context("local artifact directory")?)
        };

        Ok(Self::new(config, Arc::new(store), Arc::new(ledger), Arc::new(queue)).with_artifacts(artifacts))
    }
}

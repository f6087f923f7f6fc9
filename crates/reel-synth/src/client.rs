//! Shared HTTP plumbing for the synthesis clients.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, Response};
use tracing::warn;
use url::Url;

use crate::error::{SynthError, SynthResult};

/// reqwest client bound to one service base URL.
#[derive(Debug, Clone)]
pub(crate) struct ServiceHttp {
    pub http: Client,
    pub base: Url,
    pub max_retries: u32,
}

impl ServiceHttp {
    pub fn new(base_url: &str, timeout: Duration, max_retries: u32) -> SynthResult<Self> {
        // Trailing slash keeps `join` from dropping the last path segment
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base = Url::parse(&normalized)
            .map_err(|e| SynthError::Config(format!("{}: {}", base_url, e)))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SynthError::Network)?;
        Ok(Self {
            http,
            base,
            max_retries,
        })
    }

    pub fn url(&self, path: &str) -> SynthResult<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| SynthError::Config(format!("{}: {}", path, e)))
    }

    /// Execute with retry on transient errors.
    pub async fn with_retry<F, Fut, T>(&self, operation: F) -> SynthResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = SynthResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt));
                    warn!(
                        "Synthesis request failed (attempt {}), retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn health_check(&self) -> bool {
        let Ok(url) = self.url("health") else {
            return false;
        };
        match self.http.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("Synthesis service health check error: {}", e);
                false
            }
        }
    }
}

/// Turn a non-success response into an error.
pub(crate) async fn check_status(response: Response) -> SynthResult<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(SynthError::from_status(status, body))
}

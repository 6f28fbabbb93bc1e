//! External statistics sources
//! Mission: Fetch per-character build statistics from independent
//! community APIs without letting any one of them wedge the pipeline.
//!
//! A source never raises: rate limits, timeouts and bad payloads all
//! collapse into an explicit `Unavailable` marker so the merge step can
//! carry on with whatever did answer.

use crate::models::{AggregateKey, SourceConfig, SourcePayload};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

const MAX_RETRIES: u32 = 2;
const INITIAL_BACKOFF_MS: u64 = 200;

/// Outcome of one source call.
#[derive(Debug, Clone)]
pub enum SourceResult {
    Data(SourcePayload),
    /// Rate-limited or transiently failing; merge proceeds without it.
    Unavailable { reason: String },
}

/// One independent statistics provider.
#[async_trait]
pub trait StatSource: Send + Sync {
    fn name(&self) -> &str;
    /// Static trust weight in [0, 1].
    fn reliability(&self) -> f64;
    async fn fetch(&self, key: &AggregateKey) -> SourceResult;
}

/// HTTP-backed source hitting `{base_url}/builds/{character}`.
pub struct HttpStatSource {
    config: SourceConfig,
    client: reqwest::Client,
}

impl HttpStatSource {
    pub fn new(config: SourceConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { config, client })
    }

    /// Execute the request with a short backoff retry.
    ///
    /// Retries are capped low so a flapping source still lands inside the
    /// aggregator's per-source timeout instead of stretching the cycle.
    async fn fetch_with_retry(&self, key: &AggregateKey) -> Result<SourcePayload, String> {
        let url = format!("{}/builds/{}", self.config.base_url, key.character);
        let query = [("patch", key.patch.as_str()), ("mode", key.mode.as_str())];
        let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MS);

        for attempt in 1..=MAX_RETRIES {
            match self.client.get(&url).query(&query).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response
                            .json::<SourcePayload>()
                            .await
                            .map_err(|e| format!("bad payload: {e}"));
                    } else if status.as_u16() == 429 {
                        // Rate limited: back off at the aggregation layer,
                        // not here.
                        return Err("rate limited (429)".to_string());
                    } else if status.is_server_error() && attempt < MAX_RETRIES {
                        warn!(
                            source = self.config.name,
                            %status,
                            attempt,
                            "server error, backing off {}ms",
                            backoff.as_millis()
                        );
                        sleep(backoff).await;
                        backoff *= 2;
                    } else {
                        return Err(format!("HTTP {status}"));
                    }
                }
                Err(e) if attempt < MAX_RETRIES => {
                    warn!(source = self.config.name, attempt, "request failed: {e}");
                    sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e.to_string()),
            }
        }

        Err("max retries exceeded".to_string())
    }
}

#[async_trait]
impl StatSource for HttpStatSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn reliability(&self) -> f64 {
        self.config.reliability
    }

    async fn fetch(&self, key: &AggregateKey) -> SourceResult {
        match self.fetch_with_retry(key).await {
            Ok(payload) => {
                debug!(
                    source = self.config.name,
                    character = key.character,
                    samples = payload.sample_size,
                    "source payload fetched"
                );
                SourceResult::Data(payload)
            }
            Err(reason) => {
                warn!(
                    source = self.config.name,
                    character = key.character,
                    reason,
                    "⚠️ source unavailable"
                );
                SourceResult::Unavailable { reason }
            }
        }
    }
}

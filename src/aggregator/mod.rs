//! Reliability-Weighted Aggregator
//! Mission: Merge build statistics from several independently unreliable
//! sources into one consistent, cached view.
//!
//! Sources are queried concurrently, each inside its own timeout; a source
//! that fails or rate-limits contributes nothing and harms nobody. Scalars
//! merge as reliability-and-volume weighted averages, set-valued fields as
//! unions. Merged results live in a durable cache keyed by
//! (character, patch, mode) so restarts do not re-spend source quota.

pub mod cache;
pub mod sources;

pub use cache::{AggregateCache, CacheLookup};
pub use sources::{HttpStatSource, SourceResult, StatSource};

use crate::models::{AggregateKey, AggregatedMatchData, SourcePayload};
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// How long a cached aggregate is served without a refresh attempt.
    pub ttl_secs: i64,
    /// Hard ceiling on any single source call.
    pub source_timeout: Duration,
    /// Batch cache-hit ratio above which live collection is skipped.
    pub batch_hit_ratio_skip: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 86_400,
            source_timeout: Duration::from_secs(10),
            batch_hit_ratio_skip: 0.8,
        }
    }
}

/// Result of a batch collection, with the hit ratio callers use to decide
/// whether a full re-collection sweep is worth scheduling.
pub struct BatchCollection {
    pub results: Vec<AggregatedMatchData>,
    pub cache_hit_ratio: f64,
}

pub struct ReliabilityAggregator {
    sources: Vec<Arc<dyn StatSource>>,
    cache: Arc<AggregateCache>,
    config: AggregatorConfig,
    /// Sorted source names; part of the cache key so a config change does
    /// not serve merges from a different source mix.
    source_set: String,
}

impl ReliabilityAggregator {
    pub fn new(
        sources: Vec<Arc<dyn StatSource>>,
        cache: Arc<AggregateCache>,
        config: AggregatorConfig,
    ) -> Self {
        let mut names: Vec<&str> = sources.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        let source_set = names.join("+");

        Self {
            sources,
            cache,
            config,
            source_set,
        }
    }

    /// Merged statistics for one key, cache-first.
    pub async fn collect(&self, key: &AggregateKey) -> Result<AggregatedMatchData> {
        if let Some(hit) = self.cache.get(&self.source_set, key, self.config.ttl_secs)? {
            if hit.fresh {
                return Ok(hit.data);
            }
        }
        self.collect_live(key).await
    }

    /// Collect a batch of keys, reporting the cache hit ratio.
    ///
    /// When the ratio clears the configured threshold the misses are served
    /// from whatever is cached (marked stale) or an explicit empty
    /// aggregate, and no source calls go out.
    pub async fn collect_batch(&self, keys: &[AggregateKey]) -> Result<BatchCollection> {
        let mut results: Vec<Option<AggregatedMatchData>> = Vec::with_capacity(keys.len());
        let mut hits = 0usize;

        for key in keys {
            match self.cache.get(&self.source_set, key, self.config.ttl_secs)? {
                Some(hit) if hit.fresh => {
                    hits += 1;
                    results.push(Some(hit.data));
                }
                _ => results.push(None),
            }
        }

        let cache_hit_ratio = if keys.is_empty() {
            1.0
        } else {
            hits as f64 / keys.len() as f64
        };
        let skip_live = cache_hit_ratio > self.config.batch_hit_ratio_skip;

        if skip_live && hits < keys.len() {
            info!(
                hit_ratio = cache_hit_ratio,
                "📦 batch mostly cached, skipping live collection for the rest"
            );
        }

        let mut merged = Vec::with_capacity(keys.len());
        for (key, cached) in keys.iter().zip(results) {
            match cached {
                Some(data) => merged.push(data),
                None if skip_live => merged.push(self.fallback(key)?),
                None => merged.push(self.collect_live(key).await?),
            }
        }

        Ok(BatchCollection {
            results: merged,
            cache_hit_ratio,
        })
    }

    /// Query every source concurrently and merge whatever answered.
    async fn collect_live(&self, key: &AggregateKey) -> Result<AggregatedMatchData> {
        let fetches = self.sources.iter().map(|source| {
            let source = source.clone();
            let key = key.clone();
            let timeout = self.config.source_timeout;
            async move {
                let result = match tokio::time::timeout(timeout, source.fetch(&key)).await {
                    Ok(result) => result,
                    Err(_) => SourceResult::Unavailable {
                        reason: format!("timed out after {timeout:?}"),
                    },
                };
                (source.name().to_string(), source.reliability(), result)
            }
        });

        let outcomes = futures_util::future::join_all(fetches).await;

        let mut contributions: Vec<(String, f64, SourcePayload)> = Vec::new();
        for (name, reliability, result) in outcomes {
            match result {
                SourceResult::Data(payload) => contributions.push((name, reliability, payload)),
                SourceResult::Unavailable { reason } => {
                    debug!(source = name, reason, "source skipped in merge");
                }
            }
        }

        if contributions.is_empty() {
            warn!(key = %key.cache_key(), "🛑 every source unavailable");
            return self.fallback(key);
        }

        let data = merge(key.clone(), &contributions);
        self.cache.put(&self.source_set, &data)?;
        Ok(data)
    }

    /// Drop cached rows older than the cutoff. Returns rows deleted.
    pub fn prune_cache(&self, cutoff_epoch: i64) -> Result<usize> {
        self.cache.prune_older_than(cutoff_epoch)
    }

    /// All-sources-down policy: stale cache marked stale when present,
    /// otherwise an explicit empty, zero-confidence aggregate. Never an error.
    fn fallback(&self, key: &AggregateKey) -> Result<AggregatedMatchData> {
        if let Some(hit) = self.cache.get(&self.source_set, key, self.config.ttl_secs)? {
            let mut data = hit.data;
            data.stale = !hit.fresh;
            return Ok(data);
        }
        Ok(AggregatedMatchData::empty(key.clone()))
    }
}

/// Weighted merge across contributing sources.
///
/// Scalar statistics average with weight = reliability x sample count;
/// popular builds union with duplicates removed. The overall
/// weighted_reliability is sum(r_i * w_i) / sum(w_i) over contributors.
fn merge(
    key: AggregateKey,
    contributions: &[(String, f64, SourcePayload)],
) -> AggregatedMatchData {
    let mut rate_acc: HashMap<&str, (f64, f64)> = HashMap::new(); // item -> (sum w*v, sum w)
    let mut popular_builds: Vec<Vec<String>> = Vec::new();
    let mut sample_size = 0u64;
    let mut reliability_num = 0.0;
    let mut reliability_den = 0.0;

    for (_, reliability, payload) in contributions {
        let weight = reliability * payload.sample_size as f64;
        sample_size += payload.sample_size;
        reliability_num += reliability * weight;
        reliability_den += weight;

        for (item, rate) in &payload.item_win_rates {
            let entry = rate_acc.entry(item.as_str()).or_insert((0.0, 0.0));
            entry.0 += weight * rate;
            entry.1 += weight;
        }

        for build in &payload.popular_builds {
            if !popular_builds.contains(build) {
                popular_builds.push(build.clone());
            }
        }
    }

    let item_win_rates = rate_acc
        .into_iter()
        .filter(|(_, (_, den))| *den > 0.0)
        .map(|(item, (num, den))| (item.to_string(), num / den))
        .collect();

    let weighted_reliability = if reliability_den > 0.0 {
        reliability_num / reliability_den
    } else {
        0.0
    };

    AggregatedMatchData {
        key,
        item_win_rates,
        popular_builds,
        sample_size,
        contributing_sources: contributions.iter().map(|(n, _, _)| n.clone()).collect(),
        weighted_reliability,
        refreshed_at: Utc::now(),
        stale: false,
    }
}

#[cfg(test)]
mod tests {
    use super::sources::testing::StaticSource;
    use super::*;

    fn payload(rate: f64, samples: u64) -> SourcePayload {
        SourcePayload {
            item_win_rates: HashMap::from([("Rod of Tahuti".to_string(), rate)]),
            popular_builds: vec![vec!["Rod of Tahuti".to_string()]],
            sample_size: samples,
        }
    }

    fn key() -> AggregateKey {
        AggregateKey::new("Zeus", "11.2", "conquest")
    }

    fn aggregator(sources: Vec<Arc<StaticSource>>) -> ReliabilityAggregator {
        let sources: Vec<Arc<dyn StatSource>> = sources
            .into_iter()
            .map(|s| s as Arc<dyn StatSource>)
            .collect();
        ReliabilityAggregator::new(
            sources,
            Arc::new(AggregateCache::in_memory().unwrap()),
            AggregatorConfig::default(),
        )
    }

    #[tokio::test]
    async fn weighted_average_matches_the_formula() {
        // Reliabilities 0.9 / 0.5 / 0.1, values 10 / 20 / 30 (as
        // percentages of 100 here), equal sample counts:
        // (0.9*10 + 0.5*20 + 0.1*30) / 1.5 = 14.666...
        let agg = aggregator(vec![
            Arc::new(StaticSource::data("a", 0.9, payload(10.0, 100))),
            Arc::new(StaticSource::data("b", 0.5, payload(20.0, 100))),
            Arc::new(StaticSource::data("c", 0.1, payload(30.0, 100))),
        ]);

        let data = agg.collect(&key()).await.unwrap();
        let merged = data.item_win_rates["Rod of Tahuti"];
        assert!((merged - 14.666_666).abs() < 1e-4, "got {merged}");
        assert_eq!(data.sample_size, 300);
        assert_eq!(data.contributing_sources.len(), 3);

        // weighted_reliability = sum(r_i^2 * n) / sum(r_i * n)
        let expected = (0.81 + 0.25 + 0.01) / 1.5;
        assert!((data.weighted_reliability - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn one_down_source_does_not_fail_the_merge() {
        let agg = aggregator(vec![
            Arc::new(StaticSource::data("up", 0.9, payload(50.0, 100))),
            Arc::new(StaticSource::down("down", 0.5)),
        ]);

        let data = agg.collect(&key()).await.unwrap();
        assert_eq!(data.contributing_sources, vec!["up".to_string()]);
        assert!((data.weighted_reliability - 0.9).abs() < 1e-9);
        assert!(!data.stale);
    }

    #[tokio::test]
    async fn all_sources_down_without_cache_yields_explicit_empty() {
        let agg = aggregator(vec![Arc::new(StaticSource::down("down", 0.9))]);

        let data = agg.collect(&key()).await.unwrap();
        assert!(data.contributing_sources.is_empty());
        assert_eq!(data.weighted_reliability, 0.0);
        assert!(!data.stale);
    }

    #[tokio::test]
    async fn all_sources_down_serves_stale_cache_marked_stale() {
        let source = Arc::new(StaticSource::data("flaky", 0.9, payload(50.0, 100)));
        let cache = Arc::new(AggregateCache::in_memory().unwrap());
        let agg = ReliabilityAggregator::new(
            vec![source.clone() as Arc<dyn StatSource>],
            cache,
            AggregatorConfig {
                ttl_secs: 0, // everything is instantly stale
                ..Default::default()
            },
        );

        // Populate the cache, then take the source down.
        agg.collect(&key()).await.unwrap();
        *source.result.lock() = SourceResult::Unavailable {
            reason: "outage".to_string(),
        };

        let data = agg.collect(&key()).await.unwrap();
        assert!(data.stale);
        assert_eq!(data.contributing_sources, vec!["flaky".to_string()]);
    }

    #[tokio::test]
    async fn pruning_inside_the_retention_window_keeps_the_stale_fallback() {
        let source = Arc::new(StaticSource::data("flaky", 0.9, payload(50.0, 100)));
        let agg = ReliabilityAggregator::new(
            vec![source.clone() as Arc<dyn StatSource>],
            Arc::new(AggregateCache::in_memory().unwrap()),
            AggregatorConfig {
                ttl_secs: 0, // everything is instantly past its TTL
                ..Default::default()
            },
        );

        agg.collect(&key()).await.unwrap();
        *source.result.lock() = SourceResult::Unavailable {
            reason: "outage".to_string(),
        };

        // A retention cutoff in the past must not delete the row even
        // though the row is already past its TTL.
        let cutoff = Utc::now().timestamp() - 60;
        assert_eq!(agg.prune_cache(cutoff).unwrap(), 0);

        let data = agg.collect(&key()).await.unwrap();
        assert!(data.stale);
        assert_eq!(data.contributing_sources, vec!["flaky".to_string()]);
    }

    #[tokio::test]
    async fn fresh_cache_short_circuits_source_calls() {
        let source = Arc::new(StaticSource::data("counted", 0.9, payload(50.0, 100)));
        let agg = aggregator(vec![source.clone()]);

        agg.collect(&key()).await.unwrap();
        agg.collect(&key()).await.unwrap();
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test]
    async fn batch_reports_hit_ratio_and_skips_when_mostly_cached() {
        let source = Arc::new(StaticSource::data("counted", 0.9, payload(50.0, 100)));
        let agg = aggregator(vec![source.clone()]);

        // Warm five keys.
        let mut keys: Vec<AggregateKey> = (0..5)
            .map(|i| AggregateKey::new(&format!("God{i}"), "11.2", "conquest"))
            .collect();
        for k in &keys {
            agg.collect(k).await.unwrap();
        }
        assert_eq!(source.call_count(), 5);

        // One cold key in a batch of six: 5/6 > 0.8, so no live call goes out.
        keys.push(AggregateKey::new("Cold", "11.2", "conquest"));
        let batch = agg.collect_batch(&keys).await.unwrap();
        assert!((batch.cache_hit_ratio - 5.0 / 6.0).abs() < 1e-9);
        assert_eq!(source.call_count(), 5);
        assert_eq!(batch.results.len(), 6);
        // The cold key got the explicit empty aggregate.
        assert!(batch.results[5].contributing_sources.is_empty());
    }

    #[tokio::test]
    async fn batch_collects_live_below_the_threshold() {
        let source = Arc::new(StaticSource::data("counted", 0.9, payload(50.0, 100)));
        let agg = aggregator(vec![source.clone()]);

        let keys = vec![
            AggregateKey::new("A", "11.2", "conquest"),
            AggregateKey::new("B", "11.2", "conquest"),
        ];
        let batch = agg.collect_batch(&keys).await.unwrap();
        assert_eq!(batch.cache_hit_ratio, 0.0);
        assert_eq!(source.call_count(), 2);
    }
}

//! Core domain types and wire protocol
//!
//! Everything the live service and its collaborators exchange lives here:
//! recommendations, match contexts, aggregated source data, websocket
//! events, and the env-driven application config.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Rough classification of an enemy team's damage profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamComposition {
    HeavyPhysical,
    HeavyMagical,
    Balanced,
    Unknown,
}

/// A build recommendation produced by the engine.
///
/// Immutable once produced; every recompute yields a fresh value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub character: String,
    pub role: String,
    /// Ordered core build, small and fixed-size (six slots).
    pub core_items: Vec<String>,
    pub situational_items: Vec<String>,
    pub counter_items: Vec<String>,
    pub composition: TeamComposition,
    /// Enemy threat estimate in [0, 1].
    pub threat_level: f64,
    /// Engine confidence in [0, 1].
    pub confidence: f64,
    pub justification: String,
}

/// The match a session is currently watching. Owned exclusively by its session.
#[derive(Debug, Clone)]
pub struct MatchContext {
    pub match_id: String,
    pub character: String,
    pub role: String,
    pub enemy_roster: Vec<String>,
    /// Enemy name -> items observed on them. Last write wins.
    pub detected_items: HashMap<String, Vec<String>>,
    pub joined_at: DateTime<Utc>,
}

impl MatchContext {
    pub fn new(match_id: String, character: String, role: String, enemy_roster: Vec<String>) -> Self {
        Self {
            match_id,
            character,
            role,
            enemy_roster,
            detected_items: HashMap::new(),
            joined_at: Utc::now(),
        }
    }
}

/// Cache key for aggregated statistics: one entry per (character, patch, mode).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateKey {
    pub character: String,
    pub patch: String,
    pub mode: String,
}

impl AggregateKey {
    pub fn new(character: &str, patch: &str, mode: &str) -> Self {
        Self {
            character: character.to_string(),
            patch: patch.to_string(),
            mode: mode.to_string(),
        }
    }

    /// Stable string form used as the durable-store primary key.
    pub fn cache_key(&self) -> String {
        format!("{}:{}:{}", self.character, self.patch, self.mode)
    }
}

/// What a single statistics source returns for one key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcePayload {
    /// Item name -> win rate in [0, 1].
    pub item_win_rates: HashMap<String, f64>,
    /// Complete builds seen in the wild, most popular first.
    pub popular_builds: Vec<Vec<String>>,
    /// Number of matches backing this payload.
    pub sample_size: u64,
}

/// Merged view across all sources for one key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedMatchData {
    pub key: AggregateKey,
    /// Reliability-weighted item win rates.
    pub item_win_rates: HashMap<String, f64>,
    /// Union of popular builds across contributing sources.
    pub popular_builds: Vec<Vec<String>>,
    /// Sum of contributing sample sizes.
    pub sample_size: u64,
    /// Names of sources that actually contributed.
    pub contributing_sources: Vec<String>,
    /// Overall confidence multiplier in [0, 1].
    pub weighted_reliability: f64,
    pub refreshed_at: DateTime<Utc>,
    /// True when served past its TTL because every source was down.
    pub stale: bool,
}

impl AggregatedMatchData {
    /// Explicit no-data aggregate: all sources down and nothing cached.
    pub fn empty(key: AggregateKey) -> Self {
        Self {
            key,
            item_win_rates: HashMap::new(),
            popular_builds: Vec::new(),
            sample_size: 0,
            contributing_sources: Vec::new(),
            weighted_reliability: 0.0,
            refreshed_at: Utc::now(),
            stale: false,
        }
    }
}

/// Machine-readable reason codes surfaced to clients on error events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum ErrorReason {
    AuthenticationError,
    #[serde(rename_all = "camelCase")]
    ValidationError {
        field: String,
    },
    RateLimited,
    NotInMatch,
}

impl ErrorReason {
    pub fn validation(field: &str) -> Self {
        ErrorReason::ValidationError {
            field: field.to_string(),
        }
    }
}

/// Discriminates the three build-update triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BuildUpdateKind {
    /// First recommendation after a join, sent to the joiner only.
    Initial,
    /// Triggered by a client item report, fanned out match-wide.
    EnemyUpdate,
    /// Triggered by the background poller, fanned out match-wide.
    Refresh,
}

/// Client -> server events, `{"type": ..., "data": ...}` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum WsClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinMatch {
        match_id: String,
        character: String,
        role: String,
        #[serde(default)]
        enemy_roster: Vec<String>,
    },
    LeaveMatch,
    #[serde(rename_all = "camelCase")]
    ReportEnemyItems {
        detected_items: HashMap<String, Vec<String>>,
        #[serde(default)]
        enemy_roster: Option<Vec<String>>,
    },
    Ping {
        timestamp: i64,
    },
}

/// The complete payload of one `buildUpdate` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildUpdate {
    pub kind: BuildUpdateKind,
    #[serde(flatten)]
    pub recommendation: Recommendation,
    /// Server-side time the update was computed; strictly ordered per match.
    pub timestamp: DateTime<Utc>,
}

/// Server -> client events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum WsServerEvent {
    #[serde(rename_all = "camelCase")]
    Connected {
        session_id: uuid::Uuid,
        username: String,
    },
    BuildUpdate(BuildUpdate),
    #[serde(rename_all = "camelCase")]
    MatchLeft {
        match_id: String,
    },
    Error(ErrorReason),
    Pong {
        timestamp: i64,
    },
}

impl WsServerEvent {
    pub fn build_update(kind: BuildUpdateKind, recommendation: Recommendation) -> Self {
        WsServerEvent::BuildUpdate(BuildUpdate {
            kind,
            recommendation,
            timestamp: Utc::now(),
        })
    }
}

/// One external statistics source: where it lives and how much we trust it.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub base_url: String,
    /// Static reliability weight in [0, 1].
    pub reliability: f64,
}

/// Application configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub jwt_secret: String,
    pub cache_db_path: Option<String>,
    /// Current game patch, part of every aggregate key.
    pub patch: String,
    /// Game mode the service recommends for, part of every aggregate key.
    pub mode: String,
    pub rate_limit_quota: u32,
    pub rate_limit_window_secs: u64,
    /// Core-build symmetric difference above which a change is significant.
    pub significance_core_delta: usize,
    /// Threat-level delta above which a change is significant.
    pub significance_threat_delta: f64,
    pub poll_interval_secs: u64,
    pub poll_error_backoff_secs: u64,
    pub aggregate_ttl_secs: i64,
    /// How long expired aggregate rows are kept for the stale fallback
    /// before maintenance deletes them. Should be well beyond the TTL.
    pub cache_retention_secs: i64,
    pub source_timeout_secs: u64,
    /// Batch cache-hit ratio above which full re-collection is skipped.
    pub batch_hit_ratio_skip: f64,
    pub sources: Vec<SourceConfig>,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let sources = std::env::var("STAT_SOURCES")
            .unwrap_or_else(|_| {
                // name:base_url:reliability triples
                "forgestats:https://api.forgestats.gg:0.9,\
                 divinebuilds:https://divinebuilds.io/api:0.5,\
                 arenaboard:https://arenaboard.net/api/v2:0.1"
                    .to_string()
            })
            .split(',')
            .filter_map(|entry| {
                let entry = entry.trim();
                let (name, rest) = entry.split_once(':')?;
                let (url, reliability) = rest.rsplit_once(':')?;
                Some(SourceConfig {
                    name: name.to_string(),
                    base_url: url.to_string(),
                    reliability: reliability.parse().ok()?,
                })
            })
            .collect();

        Self {
            port: env_parse("PORT", 3000),
            jwt_secret: std::env::var("JWT_SECRET").unwrap_or_else(|_| {
                "dev-secret-change-in-production-minimum-32-characters".to_string()
            }),
            cache_db_path: std::env::var("CACHE_DB_PATH").ok(),
            patch: std::env::var("GAME_PATCH").unwrap_or_else(|_| "11.2".to_string()),
            mode: std::env::var("GAME_MODE").unwrap_or_else(|_| "conquest".to_string()),
            rate_limit_quota: env_parse("RATE_LIMIT_QUOTA", 10),
            rate_limit_window_secs: env_parse("RATE_LIMIT_WINDOW_SECS", 60),
            significance_core_delta: env_parse("SIGNIFICANCE_CORE_DELTA", 1),
            significance_threat_delta: env_parse("SIGNIFICANCE_THREAT_DELTA", 0.2),
            poll_interval_secs: env_parse("POLL_INTERVAL_SECS", 60),
            poll_error_backoff_secs: env_parse("POLL_ERROR_BACKOFF_SECS", 30),
            aggregate_ttl_secs: env_parse("AGGREGATE_TTL_SECS", 86_400),
            cache_retention_secs: env_parse("CACHE_RETENTION_SECS", 604_800),
            source_timeout_secs: env_parse("SOURCE_TIMEOUT_SECS", 10),
            batch_hit_ratio_skip: env_parse("BATCH_HIT_RATIO_SKIP", 0.8),
            sources,
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_wire_format() {
        let json = r#"{
            "type": "joinMatch",
            "data": {
                "matchId": "m1",
                "character": "Zeus",
                "role": "Mid",
                "enemyRoster": ["Loki", "Thor"]
            }
        }"#;
        let event: WsClientEvent = serde_json::from_str(json).unwrap();
        match event {
            WsClientEvent::JoinMatch {
                match_id,
                character,
                role,
                enemy_roster,
            } => {
                assert_eq!(match_id, "m1");
                assert_eq!(character, "Zeus");
                assert_eq!(role, "Mid");
                assert_eq!(enemy_roster, vec!["Loki", "Thor"]);
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn error_event_carries_field_name() {
        let event = WsServerEvent::Error(ErrorReason::validation("character"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["reason"], "validationError");
        assert_eq!(json["data"]["field"], "character");
    }

    #[test]
    fn build_update_payload_is_flat() {
        let rec = Recommendation {
            character: "Zeus".to_string(),
            role: "Mid".to_string(),
            core_items: vec!["Book of Thoth".to_string()],
            situational_items: vec![],
            counter_items: vec![],
            composition: TeamComposition::Balanced,
            threat_level: 0.4,
            confidence: 0.8,
            justification: "test".to_string(),
        };
        let json =
            serde_json::to_value(WsServerEvent::build_update(BuildUpdateKind::Initial, rec))
                .unwrap();
        assert_eq!(json["type"], "buildUpdate");
        assert_eq!(json["data"]["kind"], "initial");
        assert_eq!(json["data"]["character"], "Zeus");
        assert_eq!(json["data"]["threatLevel"], 0.4);
        assert!(json["data"]["timestamp"].is_string());
    }

    #[test]
    fn default_sources_parse() {
        let config = Config::from_env();
        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.sources[0].name, "forgestats");
        assert!((config.sources[0].reliability - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.sources[0].base_url, "https://api.forgestats.gg");
    }
}

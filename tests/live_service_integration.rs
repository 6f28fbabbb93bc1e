//! End-to-end tests for the live build service
//!
//! Drives the service through its public surface the way the websocket
//! layer does: register with a real JWT, join, report, disconnect, and
//! watch what arrives on each session's outbound channel. Sources are
//! scripted so every recommendation is deterministic.

use async_trait::async_trait;
use buildsage_backend::{
    aggregator::{
        AggregateCache, AggregatorConfig, ReliabilityAggregator, SourceResult, StatSource,
    },
    auth::{Identity, JwtHandler},
    engine::WeightedBuildEngine,
    limiter::{RateLimitConfig, RateLimiter},
    models::{
        AggregateKey, BuildUpdateKind, Recommendation, SourcePayload, WsServerEvent,
    },
    registry::SessionRegistry,
    service::{LiveBuildService, LiveServiceConfig},
    significance::{SignificanceConfig, SignificanceEvaluator},
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const JWT_SECRET: &str = "integration-test-secret-key-32chars!";

/// Scripted source whose payload tests can swap mid-run.
struct ScriptedSource {
    payload: Mutex<SourcePayload>,
}

impl ScriptedSource {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            payload: Mutex::new(SourcePayload::default()),
        })
    }

    fn set_payload(&self, payload: SourcePayload) {
        *self.payload.lock() = payload;
    }
}

#[async_trait]
impl StatSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn reliability(&self) -> f64 {
        0.9
    }

    async fn fetch(&self, _key: &AggregateKey) -> SourceResult {
        SourceResult::Data(self.payload.lock().clone())
    }
}

struct Harness {
    service: Arc<LiveBuildService>,
    jwt: JwtHandler,
    source: Arc<ScriptedSource>,
}

impl Harness {
    /// ttl_secs = 0 forces a live collection every cycle, so payload swaps
    /// take effect immediately.
    fn new(ttl_secs: i64) -> Self {
        let source = ScriptedSource::new();
        let aggregator = Arc::new(ReliabilityAggregator::new(
            vec![source.clone() as Arc<dyn StatSource>],
            Arc::new(AggregateCache::in_memory().unwrap()),
            AggregatorConfig {
                ttl_secs,
                ..Default::default()
            },
        ));

        let service = Arc::new(LiveBuildService::new(
            Arc::new(SessionRegistry::new()),
            RateLimiter::new(RateLimitConfig {
                quota: 100,
                window: Duration::from_secs(60),
            }),
            SignificanceEvaluator::new(SignificanceConfig::default()),
            Arc::new(WeightedBuildEngine),
            aggregator,
            Arc::new(JwtHandler::new(JWT_SECRET.to_string())),
            LiveServiceConfig::default(),
        ));

        Self {
            service,
            jwt: JwtHandler::new(JWT_SECRET.to_string()),
            source,
        }
    }

    async fn connect(&self, name: &str) -> (Uuid, mpsc::UnboundedReceiver<WsServerEvent>) {
        let token = self
            .jwt
            .generate_token(&Identity {
                user_id: format!("uid-{name}"),
                username: name.to_string(),
            })
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = self.service.connect(&token, tx).await.unwrap();
        match recv(&mut rx).await {
            WsServerEvent::Connected { session_id, .. } => assert_eq!(session_id, id),
            other => panic!("expected connected, got {other:?}"),
        }
        (id, rx)
    }
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<WsServerEvent>) -> WsServerEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

async fn recv_build_update(
    rx: &mut mpsc::UnboundedReceiver<WsServerEvent>,
) -> (BuildUpdateKind, Recommendation, DateTime<Utc>) {
    match recv(rx).await {
        WsServerEvent::BuildUpdate(update) => {
            (update.kind, update.recommendation, update.timestamp)
        }
        other => panic!("expected build update, got {other:?}"),
    }
}

fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<WsServerEvent>) {
    if let Ok(event) = rx.try_recv() {
        panic!("expected no event, got {event:?}");
    }
}

#[tokio::test]
async fn rejected_token_never_creates_a_session() {
    let harness = Harness::new(86_400);
    let (tx, _rx) = mpsc::unbounded_channel();

    let result = harness.service.connect("not.a.jwt", tx).await;
    assert!(result.is_err());
    assert_eq!(harness.service.registry().session_count(), 0);
}

#[tokio::test]
async fn end_to_end_report_fans_out_identically() {
    let harness = Harness::new(86_400);
    let (a, mut rx_a) = harness.connect("alice").await;
    let (b, mut rx_b) = harness.connect("bob").await;

    // Client A joins m1 as Zeus/Mid against Loki and Thor.
    harness
        .service
        .join_match(
            a,
            "m1".to_string(),
            "Zeus".to_string(),
            "Mid".to_string(),
            vec!["Loki".to_string(), "Thor".to_string()],
        )
        .await
        .unwrap();
    let (kind, initial_rec, initial_ts) = recv_build_update(&mut rx_a).await;
    assert_eq!(kind, BuildUpdateKind::Initial);
    assert_eq!(initial_rec.character, "Zeus");

    // Client B joins the same match; A's state is unaffected.
    harness
        .service
        .join_match(
            b,
            "m1".to_string(),
            "Ra".to_string(),
            "Mid".to_string(),
            vec!["Loki".to_string(), "Thor".to_string()],
        )
        .await
        .unwrap();
    let (kind, _, _) = recv_build_update(&mut rx_b).await;
    assert_eq!(kind, BuildUpdateKind::Initial);
    assert_quiet(&mut rx_a);

    // Crit items on Loki flip the counter set, which is always significant.
    tokio::time::sleep(Duration::from_millis(5)).await;
    harness
        .service
        .report_enemy_items(
            a,
            HashMap::from([(
                "Loki".to_string(),
                vec!["Deathbringer".to_string(), "Heartseeker".to_string()],
            )]),
            None,
        )
        .await
        .unwrap();

    let (kind_a, rec_a, ts_a) = recv_build_update(&mut rx_a).await;
    let (kind_b, rec_b, ts_b) = recv_build_update(&mut rx_b).await;
    assert_eq!(kind_a, BuildUpdateKind::EnemyUpdate);
    assert_eq!(kind_b, BuildUpdateKind::EnemyUpdate);

    // Identical payload to every subscriber, strictly later than A's initial.
    assert_eq!(
        serde_json::to_value(&rec_a).unwrap(),
        serde_json::to_value(&rec_b).unwrap()
    );
    assert_eq!(ts_a, ts_b);
    assert!(ts_a > initial_ts);
    assert!(rec_a.counter_items.contains(&"Spectral Armor".to_string()));
    assert!(rec_a.threat_level > initial_rec.threat_level);
}

#[tokio::test]
async fn duplicate_report_does_not_rebroadcast() {
    let harness = Harness::new(86_400);
    let (a, mut rx_a) = harness.connect("alice").await;

    harness
        .service
        .join_match(
            a,
            "m1".to_string(),
            "Zeus".to_string(),
            "Mid".to_string(),
            vec!["Loki".to_string()],
        )
        .await
        .unwrap();
    recv_build_update(&mut rx_a).await;

    let report = HashMap::from([("Loki".to_string(), vec!["Deathbringer".to_string()])]);
    harness
        .service
        .report_enemy_items(a, report.clone(), None)
        .await
        .unwrap();
    recv_build_update(&mut rx_a).await;

    // Same observation again: identical recommendation, no broadcast.
    harness
        .service
        .report_enemy_items(a, report, None)
        .await
        .unwrap();
    assert_quiet(&mut rx_a);
}

#[tokio::test]
async fn disconnect_leaves_no_dangling_subscription() {
    let harness = Harness::new(86_400);
    let (a, mut rx_a) = harness.connect("alice").await;
    let (b, mut rx_b) = harness.connect("bob").await;

    for (id, rx) in [(a, &mut rx_a), (b, &mut rx_b)] {
        harness
            .service
            .join_match(
                id,
                "m1".to_string(),
                "Zeus".to_string(),
                "Mid".to_string(),
                vec!["Loki".to_string()],
            )
            .await
            .unwrap();
        recv_build_update(rx).await;
    }

    harness.service.disconnect(a);
    assert_eq!(harness.service.registry().subscribers_of("m1"), vec![b]);

    // A report from B must not attempt delivery to the departed session.
    harness
        .service
        .report_enemy_items(
            b,
            HashMap::from([("Loki".to_string(), vec!["Deathbringer".to_string()])]),
            None,
        )
        .await
        .unwrap();
    recv_build_update(&mut rx_b).await;
    assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn poller_broadcasts_at_most_once_per_cycle() {
    // TTL zero: every poll re-collects live and sees payload swaps.
    let harness = Harness::new(0);
    let (a, mut rx_a) = harness.connect("alice").await;

    harness
        .service
        .join_match(
            a,
            "m1".to_string(),
            "Zeus".to_string(),
            "Mid".to_string(),
            vec!["Loki".to_string(), "Thor".to_string()],
        )
        .await
        .unwrap();
    recv_build_update(&mut rx_a).await;

    // Nothing changed: a poll cycle computes the identical recommendation
    // and stays quiet.
    harness.service.poll_once().await.unwrap();
    assert_quiet(&mut rx_a);

    // Fresh statistics arrive upstream: the polled build shifts completely.
    let new_build: Vec<String> = [
        "Pendulum of Ages",
        "Staff of Myrddin",
        "Charon's Coin",
        "Rod of Tahuti",
        "Soul Gem",
        "Typhon's Fang",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    harness.source.set_payload(SourcePayload {
        item_win_rates: new_build.iter().map(|i| (i.clone(), 0.6)).collect(),
        popular_builds: vec![new_build.clone()],
        sample_size: 5000,
    });

    harness.service.poll_once().await.unwrap();
    let (kind, rec, _) = recv_build_update(&mut rx_a).await;
    assert_eq!(kind, BuildUpdateKind::Refresh);
    assert_eq!(rec.core_items, new_build);
    assert_quiet(&mut rx_a);

    // Second cycle with the same statistics: nothing new to say.
    harness.service.poll_once().await.unwrap();
    assert_quiet(&mut rx_a);
}

#[tokio::test]
async fn switching_matches_moves_the_subscription() {
    let harness = Harness::new(86_400);
    let (a, mut rx_a) = harness.connect("alice").await;

    harness
        .service
        .join_match(
            a,
            "m1".to_string(),
            "Zeus".to_string(),
            "Mid".to_string(),
            vec!["Loki".to_string()],
        )
        .await
        .unwrap();
    recv_build_update(&mut rx_a).await;

    harness
        .service
        .join_match(
            a,
            "m2".to_string(),
            "Zeus".to_string(),
            "Mid".to_string(),
            vec!["Thor".to_string()],
        )
        .await
        .unwrap();
    recv_build_update(&mut rx_a).await;

    assert!(harness.service.registry().subscribers_of("m1").is_empty());
    assert_eq!(harness.service.registry().subscribers_of("m2"), vec![a]);

    harness.service.leave_match(a);
    match recv(&mut rx_a).await {
        WsServerEvent::MatchLeft { match_id } => assert_eq!(match_id, "m2"),
        other => panic!("expected matchLeft, got {other:?}"),
    }
    assert!(harness.service.registry().watched_matches().is_empty());
}

//! Live Build Service
//! Mission: One authoritative orchestrator for session lifecycle, live
//! event handling, and the background re-evaluation loop.
//!
//! Per-session state machine: Connected -> WatchingMatch -> Disconnected.
//! Every client-facing failure maps to a named error event; collaborator
//! failures are logged and absorbed, never propagated as process faults.

use crate::aggregator::ReliabilityAggregator;
use crate::auth::{Authenticator, Identity};
use crate::engine::RecommendationEngine;
use crate::limiter::RateLimiter;
use crate::models::{
    AggregateKey, AggregatedMatchData, BuildUpdateKind, ErrorReason, MatchContext, WsClientEvent,
    WsServerEvent,
};
use crate::registry::SessionRegistry;
use crate::significance::SignificanceEvaluator;
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LiveServiceConfig {
    /// Background re-evaluation period.
    pub poll_interval: Duration,
    /// Extra sleep after an unexpected poller error.
    pub poll_error_backoff: Duration,
    /// Current game patch, part of every aggregate key.
    pub patch: String,
    /// Game mode recommendations are computed for.
    pub mode: String,
}

impl Default for LiveServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            poll_error_backoff: Duration::from_secs(30),
            patch: "11.2".to_string(),
            mode: "conquest".to_string(),
        }
    }
}

pub struct LiveBuildService {
    registry: Arc<SessionRegistry>,
    limiter: RateLimiter,
    significance: SignificanceEvaluator,
    engine: Arc<dyn RecommendationEngine>,
    aggregator: Arc<ReliabilityAggregator>,
    authenticator: Arc<dyn Authenticator>,
    config: LiveServiceConfig,
    /// Per-match broadcast serialization: compute -> compare -> send runs
    /// under this lock so a match never sees out-of-order updates. The u64
    /// is the match's broadcast sequence counter.
    broadcast_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<u64>>>>,
}

impl LiveBuildService {
    pub fn new(
        registry: Arc<SessionRegistry>,
        limiter: RateLimiter,
        significance: SignificanceEvaluator,
        engine: Arc<dyn RecommendationEngine>,
        aggregator: Arc<ReliabilityAggregator>,
        authenticator: Arc<dyn Authenticator>,
        config: LiveServiceConfig,
    ) -> Self {
        Self {
            registry,
            limiter,
            significance,
            engine,
            aggregator,
            authenticator,
            config,
            broadcast_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Authenticate a token and register the connection.
    pub async fn connect(
        &self,
        token: &str,
        outbound: mpsc::UnboundedSender<WsServerEvent>,
    ) -> Result<Uuid, ErrorReason> {
        let identity = match self.authenticator.validate(token).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("🔐 connection refused: {e:#}");
                return Err(ErrorReason::AuthenticationError);
            }
        };

        let username = identity.username.clone();
        let session_id = self.registry.register(identity, outbound);
        self.registry.send_to(
            session_id,
            WsServerEvent::Connected {
                session_id,
                username: username.clone(),
            },
        );
        info!(session = %session_id, user = %username, "🔌 session connected");
        Ok(session_id)
    }

    /// Terminal transition: no further delivery, no dangling subscriptions.
    pub fn disconnect(&self, session_id: Uuid) {
        self.registry.unregister(session_id);
        debug!(session = %session_id, "session disconnected");
    }

    /// Dispatch one client event. An Err is sent back to the client as a
    /// structured error event by the transport layer.
    pub async fn handle_event(
        &self,
        session_id: Uuid,
        event: WsClientEvent,
    ) -> Result<(), ErrorReason> {
        match event {
            WsClientEvent::JoinMatch {
                match_id,
                character,
                role,
                enemy_roster,
            } => {
                self.join_match(session_id, match_id, character, role, enemy_roster)
                    .await
            }
            WsClientEvent::LeaveMatch => {
                self.leave_match(session_id);
                Ok(())
            }
            WsClientEvent::ReportEnemyItems {
                detected_items,
                enemy_roster,
            } => {
                self.report_enemy_items(session_id, detected_items, enemy_roster)
                    .await
            }
            WsClientEvent::Ping { timestamp } => {
                self.registry
                    .send_to(session_id, WsServerEvent::Pong { timestamp });
                Ok(())
            }
        }
    }

    /// Join (or switch to) a match and push an initial recommendation to
    /// the requesting session only.
    pub async fn join_match(
        &self,
        session_id: Uuid,
        match_id: String,
        character: String,
        role: String,
        enemy_roster: Vec<String>,
    ) -> Result<(), ErrorReason> {
        for (field, value) in [
            ("matchId", &match_id),
            ("character", &character),
            ("role", &role),
        ] {
            if value.trim().is_empty() {
                return Err(ErrorReason::validation(field));
            }
        }

        self.check_rate_limit(session_id)?;

        let ctx = MatchContext::new(match_id.clone(), character, role, enemy_roster);
        let key = self.aggregate_key(&ctx);
        if !self.registry.join_match(session_id, ctx.clone()) {
            // Session disconnected mid-join; nothing to do.
            return Ok(());
        }
        info!(session = %session_id, match_id = %match_id, "⚔️ joined match");

        // Initial recommendation is computed synchronously with an empty
        // detected-items map and emitted to the joiner alone.
        let data = match self.aggregator.collect(&key).await {
            Ok(data) => data,
            Err(e) => {
                error!(match_id = %match_id, "aggregation failed on join: {e:#}");
                return Ok(());
            }
        };
        match self.engine.recommend(&ctx, &data) {
            Ok(recommendation) => {
                self.registry.with_session(session_id, |s| {
                    s.last_recommendation = Some(recommendation.clone());
                });
                self.registry.send_to(
                    session_id,
                    WsServerEvent::build_update(BuildUpdateKind::Initial, recommendation),
                );
            }
            Err(e) => {
                // Engine failure: logged, session keeps going without a
                // recommendation until the next trigger.
                error!(match_id = %match_id, "engine failure on join: {e:#}");
            }
        }
        Ok(())
    }

    /// Leave the current match. Idempotent when not in one.
    pub fn leave_match(&self, session_id: Uuid) {
        if let Some(match_id) = self.registry.leave_match(session_id) {
            info!(session = %session_id, match_id = %match_id, "👋 left match");
            self.registry
                .send_to(session_id, WsServerEvent::MatchLeft { match_id });
        }
    }

    /// Merge client-observed enemy items and re-evaluate for the whole
    /// match: enemy intel is match-wide, so a significant shift broadcasts
    /// to every subscriber, not just the reporter.
    pub async fn report_enemy_items(
        &self,
        session_id: Uuid,
        detected_items: HashMap<String, Vec<String>>,
        enemy_roster: Option<Vec<String>>,
    ) -> Result<(), ErrorReason> {
        let in_match = self
            .registry
            .with_session(session_id, |s| s.match_ctx.is_some())
            .unwrap_or(false);
        if !in_match {
            return Err(ErrorReason::NotInMatch);
        }
        self.check_rate_limit(session_id)?;

        // Last write wins per enemy; no versioning.
        let ctx = self
            .registry
            .with_session(session_id, |s| {
                let ctx = s.match_ctx.as_mut()?;
                for (enemy, items) in detected_items {
                    ctx.detected_items.insert(enemy, items);
                }
                if let Some(roster) = enemy_roster {
                    ctx.enemy_roster = roster;
                }
                Some(ctx.clone())
            })
            .flatten()
            .ok_or(ErrorReason::NotInMatch)?;

        self.evaluate_and_broadcast(&ctx, session_id, BuildUpdateKind::EnemyUpdate)
            .await;
        Ok(())
    }

    /// Compute a candidate recommendation for `ctx`, diff it against what
    /// `baseline_session` last received, and fan out on significance.
    async fn evaluate_and_broadcast(
        &self,
        ctx: &MatchContext,
        baseline_session: Uuid,
        kind: BuildUpdateKind,
    ) {
        let data = match self.aggregator.collect(&self.aggregate_key(ctx)).await {
            Ok(data) => data,
            Err(e) => {
                error!(match_id = %ctx.match_id, "aggregation failed: {e:#}");
                return;
            }
        };
        self.broadcast_if_significant(ctx, baseline_session, kind, &data)
            .await;
    }

    /// Diff a candidate built from `data` against the baseline session and
    /// fan out on significance.
    ///
    /// Serialized per match so broadcasts for one match are never
    /// reordered.
    async fn broadcast_if_significant(
        &self,
        ctx: &MatchContext,
        baseline_session: Uuid,
        kind: BuildUpdateKind,
        data: &AggregatedMatchData,
    ) {
        let lock = self.broadcast_lock(&ctx.match_id);
        let mut seq = lock.lock().await;

        let candidate = match self.engine.recommend(ctx, data) {
            Ok(candidate) => candidate,
            Err(e) => {
                // Stale-but-present beats crashing the session: keep the
                // prior recommendation and skip the broadcast.
                error!(match_id = %ctx.match_id, "engine failure: {e:#}");
                return;
            }
        };

        let previous = self
            .registry
            .with_session(baseline_session, |s| s.last_recommendation.clone())
            .flatten();
        if !self
            .significance
            .is_significant(previous.as_ref(), &candidate)
        {
            debug!(match_id = %ctx.match_id, "change below significance, no broadcast");
            return;
        }

        *seq += 1;
        let event = WsServerEvent::build_update(kind, candidate.clone());
        let subscribers = self.registry.subscribers_of(&ctx.match_id);
        let fanout = subscribers.len();

        for subscriber in subscribers {
            // A broadcast becomes each recipient's new diff baseline.
            self.registry.with_session(subscriber, |s| {
                s.last_recommendation = Some(candidate.clone());
            });
            self.registry.send_to(subscriber, event.clone());
        }

        info!(
            match_id = %ctx.match_id,
            seq = *seq,
            fanout,
            kind = ?kind,
            "📡 broadcast recommendation"
        );
    }

    /// Background poller: re-evaluate every watched match on a fixed
    /// interval. Per-match work is isolated; one bad match never aborts
    /// the cycle, and an unexpected cycle error backs off instead of
    /// busy-looping.
    pub async fn run_poller(self: Arc<Self>) {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            "🔁 background poller starting"
        );
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if self.registry.session_count() == 0 {
                continue;
            }

            match self.poll_cycle().await {
                Ok(polled) => {
                    if polled > 0 {
                        debug!(matches = polled, "poll cycle complete");
                    }
                }
                Err(e) => {
                    error!("poll cycle failed: {e:#}; backing off");
                    tokio::time::sleep(self.config.poll_error_backoff).await;
                }
            }
        }
    }

    async fn poll_cycle(&self) -> Result<usize> {
        let matches = self.registry.watched_matches();
        self.prune_broadcast_locks(&matches);

        // Resolve every match's context and baseline up front so source
        // traffic can go through one batch, where the cache-hit-ratio
        // skip policy applies.
        let mut work: Vec<(MatchContext, Uuid)> = Vec::new();
        for match_id in matches {
            let Some(ctx) = self.registry.poll_context(&match_id) else {
                continue;
            };
            let baseline = self
                .registry
                .subscribers_of(&match_id)
                .into_iter()
                .next();
            let Some(baseline) = baseline else {
                continue;
            };
            work.push((ctx, baseline));
        }
        if work.is_empty() {
            return Ok(0);
        }

        let mut keys: Vec<AggregateKey> = Vec::new();
        for (ctx, _) in &work {
            let key = self.aggregate_key(ctx);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        let batch = self.aggregator.collect_batch(&keys).await?;
        debug!(
            hit_ratio = batch.cache_hit_ratio,
            keys = keys.len(),
            "🗂️ poll batch collected"
        );
        let by_key: HashMap<AggregateKey, AggregatedMatchData> =
            keys.into_iter().zip(batch.results).collect();

        let mut polled = 0usize;
        for (ctx, baseline) in work {
            let Some(data) = by_key.get(&self.aggregate_key(&ctx)) else {
                continue;
            };
            self.broadcast_if_significant(&ctx, baseline, BuildUpdateKind::Refresh, data)
                .await;
            polled += 1;
        }
        Ok(polled)
    }

    /// Periodic upkeep: evict idle rate-limit counters and expired cache
    /// rows.
    pub async fn run_maintenance(self: Arc<Self>, cache_retention_secs: i64) {
        let mut ticker = interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            self.limiter.cleanup();

            let cutoff = chrono::Utc::now().timestamp() - cache_retention_secs;
            match self.aggregator_cache_prune(cutoff) {
                Ok(0) => {}
                Ok(n) => info!("🧹 pruned {} expired aggregate rows", n),
                Err(e) => warn!("cache prune failed: {e:#}"),
            }
        }
    }

    fn aggregator_cache_prune(&self, cutoff: i64) -> Result<usize> {
        self.aggregator.prune_cache(cutoff)
    }

    fn check_rate_limit(&self, session_id: Uuid) -> Result<(), ErrorReason> {
        let identity = self
            .registry
            .with_session(session_id, |s| s.identity.clone());
        let Some(Identity { user_id, .. }) = identity else {
            // Session vanished under us; treat as a no-op elsewhere.
            return Ok(());
        };

        if self.limiter.allow(&user_id) {
            Ok(())
        } else {
            Err(ErrorReason::RateLimited)
        }
    }

    fn aggregate_key(&self, ctx: &MatchContext) -> AggregateKey {
        AggregateKey::new(&ctx.character, &self.config.patch, &self.config.mode)
    }

    fn broadcast_lock(&self, match_id: &str) -> Arc<tokio::sync::Mutex<u64>> {
        self.broadcast_locks
            .lock()
            .entry(match_id.to_string())
            .or_default()
            .clone()
    }

    fn prune_broadcast_locks(&self, live_matches: &[String]) {
        self.broadcast_locks
            .lock()
            .retain(|match_id, _| live_matches.contains(match_id));
    }

    /// One immediate poll pass, for tests and operator tooling.
    pub async fn poll_once(&self) -> Result<usize> {
        self.poll_cycle().await
    }
}

//! BuildSage - Live Build Recommendation Service
//! Mission: Keep every connected player's item build current with the
//! match they are actually in.
//!
//! One authenticated websocket session per client; client events and a
//! background poller both funnel into the same significance-gated
//! broadcast path.

use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    response::Response,
    routing::get,
    Router,
};
use dotenv::dotenv;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use buildsage_backend::{
    aggregator::{AggregateCache, AggregatorConfig, HttpStatSource, ReliabilityAggregator, StatSource},
    auth::JwtHandler,
    engine::WeightedBuildEngine,
    limiter::{RateLimitConfig, RateLimiter},
    models::{Config, ErrorReason, WsClientEvent, WsServerEvent},
    registry::SessionRegistry,
    service::{LiveBuildService, LiveServiceConfig},
    significance::{SignificanceConfig, SignificanceEvaluator},
};

/// Application state shared across all connections
#[derive(Clone)]
struct AppState {
    service: Arc<LiveBuildService>,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("🚀 BuildSage Live Recommendation Service Starting");

    let config = Config::from_env();

    let jwt_handler = Arc::new(JwtHandler::new(config.jwt_secret.clone()));

    let cache_db_path = resolve_data_path(config.cache_db_path.clone(), "buildsage_cache.db");
    let cache = Arc::new(AggregateCache::new(&cache_db_path)?);
    info!("💾 Aggregate cache at: {}", cache_db_path);

    let source_timeout = Duration::from_secs(config.source_timeout_secs);
    let mut sources: Vec<Arc<dyn StatSource>> = Vec::with_capacity(config.sources.len());
    for source_config in &config.sources {
        info!(
            "📊 Statistics source: {} (reliability {:.1})",
            source_config.name, source_config.reliability
        );
        sources.push(Arc::new(HttpStatSource::new(
            source_config.clone(),
            source_timeout,
        )?));
    }

    let aggregator = Arc::new(ReliabilityAggregator::new(
        sources,
        cache,
        AggregatorConfig {
            ttl_secs: config.aggregate_ttl_secs,
            source_timeout,
            batch_hit_ratio_skip: config.batch_hit_ratio_skip,
        },
    ));

    let service = Arc::new(LiveBuildService::new(
        Arc::new(SessionRegistry::new()),
        RateLimiter::new(RateLimitConfig {
            quota: config.rate_limit_quota,
            window: Duration::from_secs(config.rate_limit_window_secs),
        }),
        SignificanceEvaluator::new(SignificanceConfig {
            core_delta: config.significance_core_delta,
            threat_delta: config.significance_threat_delta,
        }),
        Arc::new(WeightedBuildEngine),
        aggregator,
        jwt_handler,
        LiveServiceConfig {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            poll_error_backoff: Duration::from_secs(config.poll_error_backoff_secs),
            patch: config.patch.clone(),
            mode: config.mode.clone(),
        },
    ));

    // Background re-evaluation of every watched match.
    tokio::spawn(service.clone().run_poller());

    // Cache pruning + rate-limit counter eviction. Retention runs far past
    // the TTL so stale rows stay servable through a source outage.
    tokio::spawn(
        service
            .clone()
            .run_maintenance(config.cache_retention_secs),
    );

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .with_state(AppState { service })
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 Live service listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

/// Initialize tracing with env-filter overrides
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "buildsage_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn default_data_path(filename: &str) -> String {
    // Anchor defaults to the crate directory, not the caller's cwd.
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    base.join(filename).to_string_lossy().to_string()
}

fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return default_data_path(default_filename);
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }

    base.join(p).to_string_lossy().to_string()
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate-root .env for
    // runs started with --manifest-path from elsewhere.
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let env_file = manifest_dir.join(".env");
    if env_file.exists() {
        let _ = dotenv::from_path(&env_file);
    }
}

#[derive(Deserialize)]
struct ConnectParams {
    token: String,
}

/// WebSocket entry point; the token travels as a query parameter because
/// browser websocket clients cannot set headers.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.token))
}

async fn handle_socket(socket: WebSocket, state: AppState, token: String) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsServerEvent>();

    let session_id = match state.service.connect(&token, tx).await {
        Ok(session_id) => session_id,
        Err(reason) => {
            // Connection refusal: one structured error event, then close.
            let msg = serde_json::to_string(&WsServerEvent::Error(reason))
                .unwrap_or_else(|_| "{}".to_string());
            let _ = sink.send(Message::Text(msg)).await;
            let _ = sink.close().await;
            return;
        }
    };

    // Outbound pump: per-session channel -> socket. Ends when the registry
    // drops the sender on unregister.
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let msg = serde_json::to_string(&event).unwrap_or_else(|e| {
                warn!("Failed to serialize ws event: {}", e);
                "{}".to_string()
            });
            if sink.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Inbound loop: parse and dispatch client events.
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                let event = match serde_json::from_str::<WsClientEvent>(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(session = %session_id, "malformed client event: {}", e);
                        state.service.registry().send_to(
                            session_id,
                            WsServerEvent::Error(ErrorReason::validation("type")),
                        );
                        continue;
                    }
                };

                if let Err(reason) = state.service.handle_event(session_id, event).await {
                    state
                        .service
                        .registry()
                        .send_to(session_id, WsServerEvent::Error(reason));
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Disconnect is terminal: stop delivery, clean every subscriber set.
    state.service.disconnect(session_id);
    let _ = writer.await;
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "🚀 BuildSage Operational"
}

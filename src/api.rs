//! HTTP surface.
//!
//! Thin translation layer: extract, delegate to the engine, map `EngineError`
//! to a status via its `IntoResponse`. The webhook handler acks with 202
//! before any processing happens; the drain ticker does the actual work.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::errors::EngineError;
use crate::ingest::{EnqueueAck, IngestQueue, QueueStats};
use crate::models::{
    FeedKind, IncomingEvent, ResolutionInfo, ResolutionRequest, ResolutionTrigger,
    SettlementResult, Subscription, SubscriptionParams, WebhookPayload,
};
use crate::resolution::ResolutionEngine;
use crate::subscriptions::SubscriptionRegistry;

pub struct AppState {
    pub registry: Arc<SubscriptionRegistry>,
    pub engine: Arc<ResolutionEngine>,
    pub queue: Arc<IngestQueue>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/oracle/webhook", post(post_webhook))
        .route("/api/markets/:id/resolve", post(post_resolve_market))
        .route("/api/markets/:id/resolution", get(get_market_resolution))
        .route("/api/resolution/sweep", post(post_sweep))
        .route("/api/resolution/status", get(get_resolution_status))
        .route("/api/resolution/replay", post(post_replay_failed))
        .route("/api/subscriptions", post(post_subscription))
        .route("/api/subscriptions", get(get_subscriptions))
        .route("/api/subscriptions/:market_id", delete(delete_subscription))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Accept an oracle notification. Always acks fast; processing is deferred
/// to the drain loop so slow oracles never block the sender's delivery.
async fn post_webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<WebhookPayload>,
) -> Result<(StatusCode, Json<EnqueueAck>), EngineError> {
    let ack = state.queue.enqueue(payload)?;

    // Kick a drain pass right away rather than waiting for the next tick.
    // The non-reentrancy guard makes a concurrent tick harmless.
    if !ack.duplicate {
        let queue = state.queue.clone();
        tokio::spawn(async move {
            queue.drain().await;
        });
    }

    Ok((StatusCode::ACCEPTED, Json(ack)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualResolveRequest {
    pub winning_outcome: String,
    #[serde(default)]
    pub resolver: Option<String>,
}

async fn post_resolve_market(
    State(state): State<Arc<AppState>>,
    Path(market_id): Path<String>,
    Json(req): Json<ManualResolveRequest>,
) -> Result<Json<SettlementResult>, EngineError> {
    let result = state
        .engine
        .resolve(ResolutionRequest {
            market_id,
            trigger: ResolutionTrigger::Manual,
            winning_outcome: Some(req.winning_outcome),
            resolver: req.resolver,
        })
        .await?;
    Ok(Json(result))
}

async fn get_market_resolution(
    State(state): State<Arc<AppState>>,
    Path(market_id): Path<String>,
) -> Result<Json<ResolutionInfo>, EngineError> {
    let info = state.engine.resolution_info(&market_id).await?;
    Ok(Json(info))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SweepResponse {
    resolved: Vec<SettlementResult>,
    count: usize,
}

async fn post_sweep(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SweepResponse>, EngineError> {
    let resolved = state.engine.sweep().await?;
    Ok(Json(SweepResponse {
        count: resolved.len(),
        resolved,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    queue: QueueStats,
    failed_events: Vec<IncomingEvent>,
    active_subscriptions: usize,
}

async fn get_resolution_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        queue: state.queue.stats(),
        failed_events: state.queue.failed_events(),
        active_subscriptions: state.registry.active_subscriptions().len(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplayResponse {
    requeued: usize,
}

async fn post_replay_failed(State(state): State<Arc<AppState>>) -> Json<ReplayResponse> {
    Json(ReplayResponse {
        requeued: state.queue.replay_failed(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionRequest {
    pub market_id: String,
    pub feed_kind: FeedKind,
    pub feed: String,
    #[serde(default = "default_threshold_pct")]
    pub threshold_pct: f64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_threshold_pct() -> f64 {
    1.0
}

fn default_heartbeat_secs() -> u64 {
    3600
}

async fn post_subscription(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<Subscription>), EngineError> {
    let sub = state.registry.register(
        &req.market_id,
        req.feed_kind,
        SubscriptionParams {
            feed: req.feed,
            threshold_pct: req.threshold_pct,
            heartbeat_secs: req.heartbeat_secs,
        },
    )?;
    Ok((StatusCode::CREATED, Json(sub)))
}

async fn get_subscriptions(State(state): State<Arc<AppState>>) -> Json<Vec<Subscription>> {
    Json(state.registry.active_subscriptions())
}

async fn delete_subscription(
    State(state): State<Arc<AppState>>,
    Path(market_id): Path<String>,
) -> StatusCode {
    state.registry.deactivate(&market_id);
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::PaperLedger;
    use crate::oracle::StaticOracle;
    use crate::settlement::SettlementEngine;
    use crate::stores::{InMemoryBetStore, InMemoryMarketStore};
    use chrono::Duration;
    use tokio::sync::broadcast;

    fn state() -> Arc<AppState> {
        let markets = Arc::new(InMemoryMarketStore::new());
        let bets = Arc::new(InMemoryBetStore::new());
        let registry = Arc::new(SubscriptionRegistry::new());
        let oracle = Arc::new(StaticOracle::new());
        let (events_tx, _) = broadcast::channel(16);

        let engine = Arc::new(ResolutionEngine::new(
            markets,
            registry.clone(),
            oracle,
            SettlementEngine::new(bets, Arc::new(PaperLedger::new())),
            events_tx,
            Duration::hours(24),
            Duration::minutes(5),
        ));
        let queue = Arc::new(IngestQueue::new(
            engine.clone(),
            registry.clone(),
            3,
            Duration::milliseconds(1000),
            Duration::hours(24),
        ));

        Arc::new(AppState {
            registry,
            engine,
            queue,
        })
    }

    #[tokio::test]
    async fn test_webhook_acks_with_202() {
        let state = state();
        let payload = WebhookPayload {
            event_id: Some("ev-1".to_string()),
            subscription_id: "sub-1".to_string(),
            event_type: "heartbeat".to_string(),
            timestamp: None,
            data: None,
        };

        let (status, Json(ack)) = post_webhook(State(state.clone()), Json(payload.clone()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(ack.event_id, "ev-1");
        assert!(!ack.duplicate);

        let (_, Json(ack)) = post_webhook(State(state), Json(payload)).await.unwrap();
        assert!(ack.duplicate);
    }

    #[tokio::test]
    async fn test_subscription_lifecycle_endpoints() {
        let state = state();
        let req = CreateSubscriptionRequest {
            market_id: "m1".to_string(),
            feed_kind: FeedKind::Price,
            feed: "BTC/USD".to_string(),
            threshold_pct: 1.0,
            heartbeat_secs: 3600,
        };

        let (status, Json(sub)) = post_subscription(State(state.clone()), Json(req))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(sub.market_id, "m1");

        let Json(active) = get_subscriptions(State(state.clone())).await;
        assert_eq!(active.len(), 1);

        let status = delete_subscription(State(state.clone()), Path("m1".to_string())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let Json(active) = get_subscriptions(State(state)).await;
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn test_status_endpoint_reports_queue() {
        let state = state();
        state
            .queue
            .enqueue(WebhookPayload {
                event_id: Some("ev-1".to_string()),
                subscription_id: "sub-1".to_string(),
                event_type: "heartbeat".to_string(),
                timestamp: None,
                data: None,
            })
            .unwrap();

        let Json(status) = get_resolution_status(State(state)).await;
        assert_eq!(status.queue.total_events, 1);
        assert_eq!(status.queue.pending, 1);
        assert_eq!(status.active_subscriptions, 0);
    }

    #[tokio::test]
    async fn test_resolve_unknown_market_is_validation_error() {
        let state = state();
        let err = post_resolve_market(
            State(state),
            Path("nope".to_string()),
            Json(ManualResolveRequest {
                winning_outcome: "above".to_string(),
                resolver: None,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}

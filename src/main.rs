//! SettleBot - Market Resolution & Settlement Engine
//!
//! Consumes oracle push notifications, decides when betting markets are
//! resolvable, settles them pari-mutuel style, and exposes a small admin API.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast, time::interval};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use settlebot_backend::api::{router, AppState};
use settlebot_backend::ingest::IngestQueue;
use settlebot_backend::ledger::PaperLedger;
use settlebot_backend::models::{Config, EngineEvent};
use settlebot_backend::oracle::{OracleProvider, OracleRestClient, StaticOracle};
use settlebot_backend::resolution::ResolutionEngine;
use settlebot_backend::settlement::SettlementEngine;
use settlebot_backend::stores::{InMemoryBetStore, InMemoryMarketStore};
use settlebot_backend::subscriptions::SubscriptionRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing();

    info!("🚀 SettleBot Resolution Engine starting");

    let oracle: Arc<dyn OracleProvider> = match (&config.oracle_api_url, &config.oracle_api_key) {
        (Some(url), Some(key)) => {
            info!(url = %url, "📡 Oracle REST client configured");
            Arc::new(OracleRestClient::new(url.clone(), key.clone())?)
        }
        _ => {
            warn!("No oracle API configured, falling back to static provider");
            Arc::new(StaticOracle::new())
        }
    };

    let markets = Arc::new(InMemoryMarketStore::new());
    let bets = Arc::new(InMemoryBetStore::new());
    let registry = Arc::new(SubscriptionRegistry::new());
    let ledger = Arc::new(PaperLedger::new());
    let (events_tx, events_rx) = broadcast::channel::<EngineEvent>(256);

    let settlement = SettlementEngine::new(bets.clone(), ledger.clone());
    let engine = Arc::new(ResolutionEngine::new(
        markets.clone(),
        registry.clone(),
        oracle,
        settlement,
        events_tx.clone(),
        chrono::Duration::hours(config.grace_period_hours as i64),
        chrono::Duration::seconds(config.oracle_max_age_secs as i64),
    ));

    let queue = Arc::new(IngestQueue::new(
        engine.clone(),
        registry.clone(),
        config.max_event_retries,
        chrono::Duration::milliseconds(config.base_retry_delay_ms as i64),
        chrono::Duration::hours(config.event_retention_hours as i64),
    ));

    tokio::spawn(drain_loop(queue.clone(), config.drain_interval_secs));
    tokio::spawn(sweep_loop(engine.clone(), config.sweep_interval_secs));
    tokio::spawn(cleanup_loop(queue.clone(), config.cleanup_interval_secs));
    tokio::spawn(event_logger(events_rx));

    let app_state = Arc::new(AppState {
        registry,
        engine,
        queue,
    });
    let app = router(app_state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .context("Failed to bind listener")?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "settlebot_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Periodic drain of the ingestion queue.
async fn drain_loop(queue: Arc<IngestQueue>, interval_secs: u64) {
    let mut ticker = interval(std::time::Duration::from_secs(interval_secs.max(1)));
    loop {
        ticker.tick().await;
        queue.drain().await;
    }
}

/// Fallback pass over markets the webhooks missed.
async fn sweep_loop(engine: Arc<ResolutionEngine>, interval_secs: u64) {
    let mut ticker = interval(std::time::Duration::from_secs(interval_secs.max(1)));
    loop {
        ticker.tick().await;
        if let Err(e) = engine.sweep().await {
            error!(error = %e, "Sweep pass failed");
        }
    }
}

async fn cleanup_loop(queue: Arc<IngestQueue>, interval_secs: u64) {
    let mut ticker = interval(std::time::Duration::from_secs(interval_secs.max(1)));
    loop {
        ticker.tick().await;
        queue.cleanup();
    }
}

/// Default consumer for resolution notifications. Keeps the broadcast
/// channel drained even when no other subscriber is attached.
async fn event_logger(mut rx: broadcast::Receiver<EngineEvent>) {
    loop {
        match rx.recv().await {
            Ok(EngineEvent::MarketResolved {
                market_id,
                winning_outcome,
                trigger,
                total_bets,
                total_payouts,
                partial,
            }) => {
                info!(
                    market_id = %market_id,
                    winning_outcome = %winning_outcome,
                    trigger = trigger.as_str(),
                    total_bets,
                    total_payouts,
                    partial,
                    "🏆 Market resolved and settled"
                );
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Event logger lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

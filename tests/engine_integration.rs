//! End-to-end pipeline tests: webhook ingestion through resolution to
//! settled bets and ledger transfers, using the in-memory stores and the
//! static oracle.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use settlebot_backend::errors::EngineError;
use settlebot_backend::ingest::IngestQueue;
use settlebot_backend::ledger::PaperLedger;
use settlebot_backend::models::{
    Bet, EngineEvent, FeedKind, Market, MarketCondition, ResolutionRequest, ResolutionTrigger,
    SubscriptionParams, WebhookPayload,
};
use settlebot_backend::oracle::{OracleProvider, PriceData, StaticOracle};
use settlebot_backend::resolution::ResolutionEngine;
use settlebot_backend::settlement::SettlementEngine;
use settlebot_backend::stores::{InMemoryBetStore, InMemoryMarketStore, MarketStore};
use settlebot_backend::subscriptions::SubscriptionRegistry;

struct TestApp {
    markets: Arc<InMemoryMarketStore>,
    bets: Arc<InMemoryBetStore>,
    registry: Arc<SubscriptionRegistry>,
    oracle: Arc<StaticOracle>,
    ledger: Arc<PaperLedger>,
    engine: Arc<ResolutionEngine>,
    queue: Arc<IngestQueue>,
    events_rx: broadcast::Receiver<EngineEvent>,
}

fn build_app(oracle: Arc<dyn OracleProvider>, static_handle: Arc<StaticOracle>) -> TestApp {
    let markets = Arc::new(InMemoryMarketStore::new());
    let bets = Arc::new(InMemoryBetStore::new());
    let registry = Arc::new(SubscriptionRegistry::new());
    let ledger = Arc::new(PaperLedger::new());
    let (events_tx, events_rx) = broadcast::channel(64);

    let settlement = SettlementEngine::new(bets.clone(), ledger.clone());
    let engine = Arc::new(ResolutionEngine::new(
        markets.clone(),
        registry.clone(),
        oracle,
        settlement,
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

    TestApp {
        markets,
        bets,
        registry,
        oracle: static_handle,
        ledger,
        engine,
        queue,
        events_rx,
    }
}

fn app() -> TestApp {
    let oracle = Arc::new(StaticOracle::new());
    build_app(oracle.clone(), oracle)
}

fn due_market(id: &str, condition: MarketCondition, target: f64) -> Market {
    Market::price_threshold(
        id,
        "BTC threshold market",
        "BTC/USD",
        condition,
        target,
        Utc::now() - Duration::hours(1),
    )
}

fn bet(id: &str, market: &str, user: &str, outcome: &str, amount: u64) -> Bet {
    Bet {
        id: id.to_string(),
        market_id: market.to_string(),
        user_address: user.to_string(),
        outcome: outcome.to_string(),
        amount,
        placed_at: Utc::now(),
        settled: false,
        payout_amount: None,
    }
}

fn webhook(event_id: &str, subscription_id: &str, event_type: &str) -> WebhookPayload {
    WebhookPayload {
        event_id: Some(event_id.to_string()),
        subscription_id: subscription_id.to_string(),
        event_type: event_type.to_string(),
        timestamp: Some(Utc::now().timestamp_millis()),
        data: Some(serde_json::json!({ "price": 45000.0 })),
    }
}

#[tokio::test]
async fn webhook_to_settled_market() {
    let mut app = app();
    app.markets
        .insert(due_market("m1", MarketCondition::Above, 40_000.0));
    app.bets.insert(bet("a", "m1", "alice", "above", 100));
    app.bets.insert(bet("b", "m1", "bob", "above", 300));
    app.bets.insert(bet("c", "m1", "carol", "below", 200));

    let sub = app
        .registry
        .register(
            "m1",
            FeedKind::Price,
            SubscriptionParams {
                feed: "BTC/USD".to_string(),
                threshold_pct: 1.0,
                heartbeat_secs: 3600,
            },
        )
        .unwrap();
    app.oracle.set_price("BTC/USD", 45_000.0, Utc::now());

    app.queue
        .enqueue(webhook("ev-1", &sub.id, "threshold_breach"))
        .unwrap();
    let stats = app.queue.drain().await;
    assert_eq!(stats.resolved, 1);

    // Market is resolved with the oracle-derived outcome.
    let market = app.markets.get("m1").await.unwrap().unwrap();
    assert!(market.resolved);
    assert_eq!(market.winning_outcome.as_deref(), Some("above"));

    // Pari-mutuel split: pool 600 over winning pool 400.
    let alice = app.bets.get("a").unwrap();
    let bob = app.bets.get("b").unwrap();
    let carol = app.bets.get("c").unwrap();
    assert_eq!(alice.payout_amount, Some(150));
    assert_eq!(bob.payout_amount, Some(450));
    assert_eq!(carol.payout_amount, Some(0));
    assert!(alice.settled && bob.settled && carol.settled);

    assert_eq!(app.ledger.total_transferred(), 600);

    // Subscription released, notification published.
    assert!(app.registry.lookup("m1").is_none());
    match app.events_rx.try_recv().unwrap() {
        EngineEvent::MarketResolved {
            market_id,
            total_payouts,
            trigger,
            ..
        } => {
            assert_eq!(market_id, "m1");
            assert_eq!(total_payouts, 600);
            assert_eq!(trigger, ResolutionTrigger::Oracle);
        }
    }
}

#[tokio::test]
async fn redelivered_webhook_settles_once() {
    let app = app();
    app.markets
        .insert(due_market("m1", MarketCondition::Above, 40_000.0));
    app.bets.insert(bet("a", "m1", "alice", "above", 100));

    let sub = app
        .registry
        .register(
            "m1",
            FeedKind::Price,
            SubscriptionParams {
                feed: "BTC/USD".to_string(),
                threshold_pct: 1.0,
                heartbeat_secs: 3600,
            },
        )
        .unwrap();
    app.oracle.set_price("BTC/USD", 45_000.0, Utc::now());

    // The sender delivers the same notification three times.
    for _ in 0..3 {
        app.queue
            .enqueue(webhook("ev-dup", &sub.id, "threshold_breach"))
            .unwrap();
    }
    let stats = app.queue.drain().await;
    assert_eq!(stats.resolved, 1);

    // Exactly one transfer despite the redeliveries.
    assert_eq!(app.ledger.entries().len(), 1);
    assert_eq!(app.ledger.total_transferred(), 100);
}

#[tokio::test]
async fn concurrent_manual_and_oracle_resolution_single_settlement() {
    let app = app();
    app.markets
        .insert(due_market("m1", MarketCondition::Below, 50_000.0));
    app.bets.insert(bet("a", "m1", "alice", "below", 500));

    app.registry
        .register(
            "m1",
            FeedKind::Price,
            SubscriptionParams {
                feed: "BTC/USD".to_string(),
                threshold_pct: 1.0,
                heartbeat_secs: 3600,
            },
        )
        .unwrap();
    app.oracle.set_price("BTC/USD", 45_000.0, Utc::now());

    let manual_engine = app.engine.clone();
    let oracle_engine = app.engine.clone();

    let manual = tokio::spawn(async move {
        manual_engine
            .resolve(ResolutionRequest {
                market_id: "m1".to_string(),
                trigger: ResolutionTrigger::Manual,
                winning_outcome: Some("below".to_string()),
                resolver: Some("admin".to_string()),
            })
            .await
    });
    let oracle = tokio::spawn(async move { oracle_engine.oracle_resolve("m1", None).await });

    let (r1, r2) = (manual.await.unwrap(), oracle.await.unwrap());
    let winners = [&r1, &r2].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);

    // Both triggers agree on the outcome here; either way only one settles.
    assert_eq!(app.ledger.entries().len(), 1);
    let alice = app.bets.get("a").unwrap();
    assert_eq!(alice.payout_amount, Some(500));
}

struct ToggleOracle {
    broken: AtomicBool,
    inner: StaticOracle,
}

#[async_trait]
impl OracleProvider for ToggleOracle {
    async fn latest_price(&self, feed: &str) -> Result<Option<PriceData>> {
        if self.broken.load(Ordering::Acquire) {
            anyhow::bail!("oracle rpc down");
        }
        self.inner.latest_price(feed).await
    }
}

#[tokio::test]
async fn transient_oracle_outage_recovers_through_retry() {
    let toggle = Arc::new(ToggleOracle {
        broken: AtomicBool::new(true),
        inner: StaticOracle::new(),
    });
    let app = build_app(toggle.clone(), Arc::new(StaticOracle::new()));

    app.markets
        .insert(due_market("m1", MarketCondition::Above, 40_000.0));
    app.bets.insert(bet("a", "m1", "alice", "above", 100));
    let sub = app
        .registry
        .register(
            "m1",
            FeedKind::Price,
            SubscriptionParams {
                feed: "BTC/USD".to_string(),
                threshold_pct: 1.0,
                heartbeat_secs: 3600,
            },
        )
        .unwrap();

    app.queue
        .enqueue(webhook("ev-1", &sub.id, "price_update"))
        .unwrap();

    // First pass fails and schedules a retry.
    let t0 = Utc::now();
    let stats = app.queue.drain_at(t0).await;
    assert_eq!(stats.retried, 1);
    assert!(!app.markets.get("m1").await.unwrap().unwrap().resolved);

    // Oracle comes back before the retry fires.
    toggle.inner.set_price("BTC/USD", 45_000.0, Utc::now());
    toggle.broken.store(false, Ordering::Release);

    let stats = app.queue.drain_at(t0 + Duration::milliseconds(1000)).await;
    assert_eq!(stats.resolved, 1);
    assert!(app.markets.get("m1").await.unwrap().unwrap().resolved);
    assert!(app.queue.failed_events().is_empty());
}

#[tokio::test]
async fn sweep_picks_up_market_missed_by_webhooks() {
    let app = app();

    // Deadline long past, no subscription left: only the timeout path works.
    let mut market = due_market("m1", MarketCondition::Above, 40_000.0);
    market.resolve_deadline = Utc::now() - Duration::hours(30);
    app.markets.insert(market);
    app.bets.insert(bet("a", "m1", "alice", "below", 250));
    app.oracle
        .set_price("BTC/USD", 39_000.0, Utc::now() - Duration::hours(6));

    let resolved = app.engine.sweep().await.unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].winning_outcome, "below");
    assert_eq!(resolved[0].total_payouts, 250);

    // A second sweep finds nothing left to do.
    assert!(app.engine.sweep().await.unwrap().is_empty());
}

#[tokio::test]
async fn stale_oracle_blocks_oracle_trigger_but_not_timeout() {
    let app = app();
    let mut market = due_market("m1", MarketCondition::Above, 40_000.0);
    market.resolve_deadline = Utc::now() - Duration::hours(30);
    app.markets.insert(market);

    app.registry
        .register(
            "m1",
            FeedKind::Price,
            SubscriptionParams {
                feed: "BTC/USD".to_string(),
                threshold_pct: 1.0,
                heartbeat_secs: 3600,
            },
        )
        .unwrap();
    app.oracle
        .set_price("BTC/USD", 45_000.0, Utc::now() - Duration::hours(2));

    let err = app.engine.oracle_resolve("m1", None).await.unwrap_err();
    assert!(matches!(err, EngineError::StaleOracleData(_)));

    // Timeout resolution accepts the last known value once the grace period
    // has elapsed.
    let result = app
        .engine
        .resolve(ResolutionRequest {
            market_id: "m1".to_string(),
            trigger: ResolutionTrigger::Timeout,
            winning_outcome: None,
            resolver: None,
        })
        .await
        .unwrap();
    assert_eq!(result.winning_outcome, "above");
}

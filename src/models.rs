use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Comparison operator a price market is settled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketCondition {
    Above,
    Below,
}

/// Snapshot of a betting market as read from the market store.
///
/// The engine only ever transitions `resolved` false -> true and fills in
/// `winning_outcome`; every other field is owned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub description: String,
    /// Oracle feed key this market settles against, e.g. "BTC/USD".
    pub feed: String,
    pub condition: MarketCondition,
    pub target_price: f64,
    /// Allowed winning outcomes for this market.
    pub outcomes: Vec<String>,
    pub resolve_deadline: DateTime<Utc>,
    pub resolved: bool,
    pub winning_outcome: Option<String>,
}

impl Market {
    /// Standard price-threshold market with the two canonical outcomes.
    pub fn price_threshold(
        id: impl Into<String>,
        description: impl Into<String>,
        feed: impl Into<String>,
        condition: MarketCondition,
        target_price: f64,
        resolve_deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            feed: feed.into(),
            condition,
            target_price,
            outcomes: vec!["above".to_string(), "below".to_string()],
            resolve_deadline,
            resolved: false,
            winning_outcome: None,
        }
    }
}

/// A single wager, owned by the bet store. Amounts are integers in the
/// smallest currency unit; `settled` is monotonic false -> true and
/// `payout_amount` is immutable once set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub id: String,
    pub market_id: String,
    pub user_address: String,
    pub outcome: String,
    pub amount: u64,
    pub placed_at: DateTime<Utc>,
    pub settled: bool,
    pub payout_amount: Option<u64>,
}

/// What kind of oracle feed a subscription delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Price,
    Event,
}

/// A standing link between a market and an oracle feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub market_id: String,
    pub feed: String,
    pub feed_kind: FeedKind,
    /// Price-move threshold (percent) that triggers a push notification.
    pub threshold_pct: f64,
    pub heartbeat_secs: u64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Caller-supplied parameters for registering a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub feed: String,
    pub threshold_pct: f64,
    pub heartbeat_secs: u64,
}

/// Oracle notification kinds, decoded once at the ingestion boundary so the
/// drain loop dispatches with an exhaustive match instead of string compares.
/// Payload prices are advisory only; handlers always re-read the oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    PriceUpdate {
        price: Option<f64>,
        prev_price: Option<f64>,
    },
    ThresholdBreach {
        price: Option<f64>,
    },
    Heartbeat,
    EventData {
        outcome: Option<String>,
    },
    /// Anything we do not understand. Marked failed on drain, never retried.
    Unknown {
        raw: String,
    },
}

impl EventKind {
    /// Decode the wire `eventType` + `data` pair.
    pub fn from_wire(event_type: &str, data: Option<&serde_json::Value>) -> Self {
        let price = data.and_then(|d| d.get("price")).and_then(|v| v.as_f64());
        let prev_price = data
            .and_then(|d| d.get("prevPrice"))
            .and_then(|v| v.as_f64());
        match event_type {
            "price_update" => EventKind::PriceUpdate { price, prev_price },
            "threshold_breach" => EventKind::ThresholdBreach { price },
            "heartbeat" => EventKind::Heartbeat,
            "event_data" => EventKind::EventData {
                outcome: data
                    .and_then(|d| d.get("outcome"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
            },
            other => EventKind::Unknown {
                raw: other.to_string(),
            },
        }
    }
}

/// A raw oracle notification awaiting processing. `id` is the global dedup
/// key; a webhook retried by the sender lands on the same entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingEvent {
    pub id: String,
    pub subscription_id: String,
    pub kind: EventKind,
    pub received_at: DateTime<Utc>,
    pub retry_count: u32,
    pub processed: bool,
    pub last_error: Option<String>,
}

/// Inbound webhook payload (camelCase on the wire, matching the oracle
/// network's notification format).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// Sender-side dedup key. Assigned locally when absent.
    #[serde(default)]
    pub event_id: Option<String>,
    pub subscription_id: String,
    pub event_type: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Why a resolution attempt was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionTrigger {
    Manual,
    Oracle,
    Timeout,
}

impl ResolutionTrigger {
    pub fn as_str(&self) -> &str {
        match self {
            ResolutionTrigger::Manual => "manual",
            ResolutionTrigger::Oracle => "oracle",
            ResolutionTrigger::Timeout => "timeout",
        }
    }
}

/// One attempt to resolve a market. Transient input, never persisted.
#[derive(Debug, Clone)]
pub struct ResolutionRequest {
    pub market_id: String,
    pub trigger: ResolutionTrigger,
    /// Explicit outcome: required for manual resolution, optional for
    /// oracle resolution driven by an `event_data` notification.
    pub winning_outcome: Option<String>,
    pub resolver: Option<String>,
}

/// One bet's outcome of settlement. Transient computation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutCalculation {
    pub bet_id: String,
    pub user_address: String,
    pub outcome: String,
    pub bet_amount: u64,
    pub payout_amount: u64,
    pub is_winner: bool,
    pub profit_loss: i64,
}

/// One ledger transfer attempt during settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAttempt {
    pub bet_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate result of resolving and settling a market.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResult {
    pub market_id: String,
    pub winning_outcome: String,
    pub total_bets: usize,
    /// Serialized as a string: smallest-unit totals can exceed what JSON
    /// consumers handle as a number.
    #[serde(with = "u64_string")]
    pub total_payouts: u64,
    pub transfers: Vec<TransferAttempt>,
    /// True when at least one transfer failed. The resolution itself stands;
    /// only the failed transfers need out-of-band retry.
    pub partial: bool,
}

/// Per-market eligibility snapshot for the inspection endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionInfo {
    pub market_id: String,
    pub resolved: bool,
    pub winning_outcome: Option<String>,
    pub resolve_deadline: DateTime<Utc>,
    pub can_resolve_manual: bool,
    pub can_resolve_oracle: bool,
    pub can_resolve_timeout: bool,
}

/// Fire-and-forget notification published after a market settles.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    MarketResolved {
        market_id: String,
        winning_outcome: String,
        trigger: ResolutionTrigger,
        total_bets: usize,
        total_payouts: u64,
        partial: bool,
    },
}

mod u64_string {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub oracle_api_url: Option<String>,
    pub oracle_api_key: Option<String>,
    /// Oracle data older than this is unusable for oracle-triggered resolution.
    pub oracle_max_age_secs: u64,
    pub drain_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub event_retention_hours: u64,
    pub max_event_retries: u32,
    pub base_retry_delay_ms: u64,
    pub grace_period_hours: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .unwrap_or(3000);

        let oracle_api_url = std::env::var("ORACLE_API_URL").ok().filter(|s| !s.is_empty());
        let oracle_api_key = std::env::var("ORACLE_API_KEY").ok().filter(|s| !s.is_empty());

        Ok(Self {
            port,
            oracle_api_url,
            oracle_api_key,
            oracle_max_age_secs: env_u64("ORACLE_MAX_AGE_SECS", 300),
            drain_interval_secs: env_u64("DRAIN_INTERVAL_SECS", 5),
            sweep_interval_secs: env_u64("SWEEP_INTERVAL_SECS", 60),
            cleanup_interval_secs: env_u64("CLEANUP_INTERVAL_SECS", 3600),
            event_retention_hours: env_u64("EVENT_RETENTION_HOURS", 24),
            max_event_retries: env_u64("MAX_EVENT_RETRIES", 3) as u32,
            base_retry_delay_ms: env_u64("BASE_RETRY_DELAY_MS", 1000),
            grace_period_hours: env_u64("GRACE_PERIOD_HOURS", 24),
        })
    }
}

fn env_u64(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

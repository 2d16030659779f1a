//! Oracle price provider.
//!
//! The engine never trusts prices carried in webhook payloads: events can
//! arrive out of order and delayed, so every resolution decision re-reads the
//! latest value through this trait. Staleness policy lives in the resolution
//! engine, not here.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use std::{collections::HashMap, time::Duration};
use tracing::debug;

/// Latest observation for a feed.
#[derive(Debug, Clone)]
pub struct PriceData {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

#[async_trait]
pub trait OracleProvider: Send + Sync {
    /// Latest value for a feed, or None if the provider has never seen it.
    async fn latest_price(&self, feed: &str) -> Result<Option<PriceData>>;
}

/// REST client for the oracle network's price API.
pub struct OracleRestClient {
    client: Client,
    api_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: f64,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    source: Option<String>,
}

impl OracleRestClient {
    pub fn new(api_url: String, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build oracle HTTP client")?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl OracleProvider for OracleRestClient {
    async fn latest_price(&self, feed: &str) -> Result<Option<PriceData>> {
        let url = format!("{}/prices/{}", self.api_url, feed);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("oracle price request failed")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .context("oracle price request returned error status")?;

        let body: PriceResponse = response
            .json()
            .await
            .context("failed to parse oracle price response")?;

        // Timestamps come back in epoch milliseconds; fall back to "now"
        // for providers that omit them.
        let timestamp = body
            .timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        debug!(feed, price = body.price, "Oracle price fetched");

        Ok(Some(PriceData {
            price: body.price,
            timestamp,
            source: body.source.unwrap_or_else(|| "oracle".to_string()),
        }))
    }
}

/// Fixed in-memory provider. Used when no oracle API is configured and by
/// tests that need deterministic prices.
pub struct StaticOracle {
    prices: RwLock<HashMap<String, PriceData>>,
}

impl StaticOracle {
    pub fn new() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_price(&self, feed: &str, price: f64, timestamp: DateTime<Utc>) {
        self.prices.write().insert(
            feed.to_string(),
            PriceData {
                price,
                timestamp,
                source: "static".to_string(),
            },
        );
    }

    pub fn clear(&self, feed: &str) {
        self.prices.write().remove(feed);
    }
}

impl Default for StaticOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OracleProvider for StaticOracle {
    async fn latest_price(&self, feed: &str) -> Result<Option<PriceData>> {
        Ok(self.prices.read().get(feed).cloned())
    }
}

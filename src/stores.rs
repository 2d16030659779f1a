//! Market and bet store seams.
//!
//! The engine never owns markets or bets; it reads snapshots and transitions
//! the `resolved` / `settled` flags through these traits. The in-memory
//! implementations back tests and single-process deployments; a database
//! store plugs in behind the same traits.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::models::{Bet, Market};

#[async_trait]
pub trait MarketStore: Send + Sync {
    async fn get(&self, market_id: &str) -> Result<Option<Market>>;

    async fn unresolved_markets(&self) -> Result<Vec<Market>>;

    /// Atomically transition `resolved` false -> true and persist the winning
    /// outcome. Returns false if the market was already resolved; the caller
    /// lost the race.
    async fn try_mark_resolved(&self, market_id: &str, winning_outcome: &str) -> Result<bool>;
}

#[async_trait]
pub trait BetStore: Send + Sync {
    async fn bets_for_market(&self, market_id: &str) -> Result<Vec<Bet>>;

    /// Record a bet as settled with its payout. `settled` is monotonic: a
    /// second call for the same bet is a no-op and the original payout stays.
    async fn mark_settled(&self, bet_id: &str, payout_amount: u64) -> Result<()>;
}

pub struct InMemoryMarketStore {
    markets: RwLock<HashMap<String, Market>>,
}

impl InMemoryMarketStore {
    pub fn new() -> Self {
        Self {
            markets: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, market: Market) {
        self.markets.write().insert(market.id.clone(), market);
    }
}

impl Default for InMemoryMarketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketStore for InMemoryMarketStore {
    async fn get(&self, market_id: &str) -> Result<Option<Market>> {
        Ok(self.markets.read().get(market_id).cloned())
    }

    async fn unresolved_markets(&self) -> Result<Vec<Market>> {
        Ok(self
            .markets
            .read()
            .values()
            .filter(|m| !m.resolved)
            .cloned()
            .collect())
    }

    async fn try_mark_resolved(&self, market_id: &str, winning_outcome: &str) -> Result<bool> {
        let mut markets = self.markets.write();
        let market = markets
            .get_mut(market_id)
            .ok_or_else(|| anyhow::anyhow!("unknown market {market_id}"))?;
        if market.resolved {
            return Ok(false);
        }
        market.resolved = true;
        market.winning_outcome = Some(winning_outcome.to_string());
        Ok(true)
    }
}

pub struct InMemoryBetStore {
    bets: RwLock<HashMap<String, Bet>>,
}

impl InMemoryBetStore {
    pub fn new() -> Self {
        Self {
            bets: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, bet: Bet) {
        self.bets.write().insert(bet.id.clone(), bet);
    }

    pub fn get(&self, bet_id: &str) -> Option<Bet> {
        self.bets.read().get(bet_id).cloned()
    }
}

impl Default for InMemoryBetStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BetStore for InMemoryBetStore {
    async fn bets_for_market(&self, market_id: &str) -> Result<Vec<Bet>> {
        let mut bets: Vec<Bet> = self
            .bets
            .read()
            .values()
            .filter(|b| b.market_id == market_id)
            .cloned()
            .collect();
        bets.sort_by(|a, b| a.placed_at.cmp(&b.placed_at));
        Ok(bets)
    }

    async fn mark_settled(&self, bet_id: &str, payout_amount: u64) -> Result<()> {
        let mut bets = self.bets.write();
        let bet = bets
            .get_mut(bet_id)
            .ok_or_else(|| anyhow::anyhow!("unknown bet {bet_id}"))?;
        if bet.settled {
            return Ok(());
        }
        bet.settled = true;
        bet.payout_amount = Some(payout_amount);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MarketCondition;
    use chrono::Utc;

    fn market(id: &str) -> Market {
        Market::price_threshold(id, "test", "BTC/USD", MarketCondition::Above, 100.0, Utc::now())
    }

    #[tokio::test]
    async fn test_try_mark_resolved_is_at_most_once() {
        let store = InMemoryMarketStore::new();
        store.insert(market("m1"));

        assert!(store.try_mark_resolved("m1", "above").await.unwrap());
        assert!(!store.try_mark_resolved("m1", "below").await.unwrap());

        let m = store.get("m1").await.unwrap().unwrap();
        assert!(m.resolved);
        assert_eq!(m.winning_outcome.as_deref(), Some("above"));
    }

    #[tokio::test]
    async fn test_mark_settled_is_monotonic() {
        let store = InMemoryBetStore::new();
        store.insert(Bet {
            id: "b1".to_string(),
            market_id: "m1".to_string(),
            user_address: "alice".to_string(),
            outcome: "above".to_string(),
            amount: 100,
            placed_at: Utc::now(),
            settled: false,
            payout_amount: None,
        });

        store.mark_settled("b1", 150).await.unwrap();
        // Second settle attempt must not rewrite the payout.
        store.mark_settled("b1", 999).await.unwrap();

        let bet = store.get("b1").unwrap();
        assert!(bet.settled);
        assert_eq!(bet.payout_amount, Some(150));
    }
}

//! Resolution Decision Engine
//!
//! A market moves Open -> PendingResolution -> Resolved. Pending is implicit:
//! an open market whose deadline has passed or whose oracle data satisfies a
//! trigger condition. Resolution itself must happen at most once, so the
//! eligibility-check-then-mark-resolved sequence runs under a per-market
//! lock and the store performs the final compare-and-set on the resolved
//! flag. Settlement runs after the lock is released; it only reads the
//! now-immutable outcome and writes independent bet records.

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::models::{
    EngineEvent, Market, MarketCondition, ResolutionInfo, ResolutionRequest, ResolutionTrigger,
    SettlementResult,
};
use crate::oracle::{OracleProvider, PriceData};
use crate::settlement::SettlementEngine;
use crate::stores::MarketStore;
use crate::subscriptions::SubscriptionRegistry;

pub struct ResolutionEngine {
    markets: Arc<dyn MarketStore>,
    registry: Arc<SubscriptionRegistry>,
    oracle: Arc<dyn OracleProvider>,
    settlement: SettlementEngine,
    events_tx: broadcast::Sender<EngineEvent>,
    /// Per-market mutual exclusion for the check-then-mark sequence.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    grace_period: Duration,
    oracle_max_age: Duration,
}

impl ResolutionEngine {
    pub fn new(
        markets: Arc<dyn MarketStore>,
        registry: Arc<SubscriptionRegistry>,
        oracle: Arc<dyn OracleProvider>,
        settlement: SettlementEngine,
        events_tx: broadcast::Sender<EngineEvent>,
        grace_period: Duration,
        oracle_max_age: Duration,
    ) -> Self {
        Self {
            markets,
            registry,
            oracle,
            settlement,
            events_tx,
            locks: Mutex::new(HashMap::new()),
            grace_period,
            oracle_max_age,
        }
    }

    fn market_lock(&self, market_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(market_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Attempt to resolve a market and settle its bets.
    ///
    /// At most one call per market ever succeeds; a concurrent loser gets
    /// `AlreadyResolved`. Once the resolved flag is committed the resolution
    /// stands even if settlement transfers fail downstream; those surface
    /// as a `partial` settlement result, never a rollback.
    pub async fn resolve(
        &self,
        request: ResolutionRequest,
    ) -> Result<SettlementResult, EngineError> {
        let lock = self.market_lock(&request.market_id);
        let guard = lock.lock().await;

        let market = self
            .markets
            .get(&request.market_id)
            .await
            .map_err(EngineError::Store)?
            .ok_or_else(|| {
                EngineError::Validation(format!("unknown market {}", request.market_id))
            })?;

        if market.resolved {
            return Err(EngineError::AlreadyResolved(market.id));
        }

        let oracle_data = self.check_eligibility(&market, request.trigger).await?;
        let outcome = self.determine_outcome(&market, &request, oracle_data)?;

        let won = self
            .markets
            .try_mark_resolved(&market.id, &outcome)
            .await
            .map_err(EngineError::Store)?;
        if !won {
            return Err(EngineError::AlreadyResolved(market.id));
        }
        drop(guard);
        // The resolved flag is committed, so the mutex has no further use.
        // Late arrivals that still hold the Arc see `AlreadyResolved`.
        self.locks.lock().remove(&market.id);

        info!(
            market_id = %market.id,
            winning_outcome = %outcome,
            trigger = request.trigger.as_str(),
            resolver = request.resolver.as_deref().unwrap_or("system"),
            "🏁 Market resolved"
        );

        self.registry.deactivate(&market.id);

        let result = self
            .settlement
            .settle(&market.id, &outcome)
            .await
            .map_err(EngineError::Store)?;

        // Fire-and-forget: nobody listening is fine.
        let _ = self.events_tx.send(EngineEvent::MarketResolved {
            market_id: result.market_id.clone(),
            winning_outcome: result.winning_outcome.clone(),
            trigger: request.trigger,
            total_bets: result.total_bets,
            total_payouts: result.total_payouts,
            partial: result.partial,
        });

        Ok(result)
    }

    /// Oracle-triggered resolution, invoked by the drain loop. An explicit
    /// outcome (from an `event_data` notification) takes precedence over the
    /// price comparison; either way the oracle is re-read, never the payload.
    pub async fn oracle_resolve(
        &self,
        market_id: &str,
        proposed_outcome: Option<String>,
    ) -> Result<SettlementResult, EngineError> {
        self.resolve(ResolutionRequest {
            market_id: market_id.to_string(),
            trigger: ResolutionTrigger::Oracle,
            winning_outcome: proposed_outcome,
            resolver: None,
        })
        .await
    }

    /// Eligibility per trigger type. Returns the oracle observation for the
    /// triggers that need one, so outcome determination reuses the same read.
    async fn check_eligibility(
        &self,
        market: &Market,
        trigger: ResolutionTrigger,
    ) -> Result<Option<PriceData>, EngineError> {
        let now = Utc::now();
        match trigger {
            ResolutionTrigger::Manual => {
                if now < market.resolve_deadline {
                    return Err(EngineError::NotResolvable(format!(
                        "deadline {} not reached",
                        market.resolve_deadline
                    )));
                }
                Ok(None)
            }
            ResolutionTrigger::Oracle => {
                let sub = self.registry.lookup(&market.id).ok_or_else(|| {
                    EngineError::NotResolvable(format!(
                        "no active subscription for market {}",
                        market.id
                    ))
                })?;
                let data = self
                    .oracle
                    .latest_price(&sub.feed)
                    .await
                    .map_err(EngineError::Oracle)?
                    .ok_or_else(|| {
                        EngineError::StaleOracleData(format!("no data for feed {}", sub.feed))
                    })?;
                let age = now - data.timestamp;
                if age > self.oracle_max_age {
                    return Err(EngineError::StaleOracleData(format!(
                        "feed {} is {}s old",
                        sub.feed,
                        age.num_seconds()
                    )));
                }
                Ok(Some(data))
            }
            ResolutionTrigger::Timeout => {
                if now < market.resolve_deadline + self.grace_period {
                    return Err(EngineError::NotResolvable(format!(
                        "grace period for market {} has not elapsed",
                        market.id
                    )));
                }
                // The grace period already expired, so the last known value
                // is accepted even if stale.
                let data = self
                    .oracle
                    .latest_price(&market.feed)
                    .await
                    .map_err(EngineError::Oracle)?
                    .ok_or_else(|| {
                        EngineError::NotResolvable(format!(
                            "no oracle data for timeout resolution of market {}",
                            market.id
                        ))
                    })?;
                Ok(Some(data))
            }
        }
    }

    fn determine_outcome(
        &self,
        market: &Market,
        request: &ResolutionRequest,
        oracle_data: Option<PriceData>,
    ) -> Result<String, EngineError> {
        if let Some(outcome) = &request.winning_outcome {
            if !market.outcomes.iter().any(|o| o == outcome) {
                return Err(EngineError::Validation(format!(
                    "outcome '{}' is not valid for market {} (allowed: {})",
                    outcome,
                    market.id,
                    market.outcomes.join(", ")
                )));
            }
            return Ok(outcome.clone());
        }

        if request.trigger == ResolutionTrigger::Manual {
            return Err(EngineError::Validation(
                "manual resolution requires a winning outcome".to_string(),
            ));
        }

        let data = oracle_data.ok_or_else(|| {
            EngineError::StaleOracleData(format!("no oracle data for market {}", market.id))
        })?;

        let outcome = match market.condition {
            MarketCondition::Above => {
                if data.price >= market.target_price {
                    "above"
                } else {
                    "below"
                }
            }
            MarketCondition::Below => {
                if data.price <= market.target_price {
                    "below"
                } else {
                    "above"
                }
            }
        };

        debug!(
            market_id = %market.id,
            price = data.price,
            target = market.target_price,
            outcome,
            "Outcome determined from oracle data"
        );

        Ok(outcome.to_string())
    }

    /// Eligibility snapshot for the inspection endpoint.
    pub async fn resolution_info(&self, market_id: &str) -> Result<ResolutionInfo, EngineError> {
        let market = self
            .markets
            .get(market_id)
            .await
            .map_err(EngineError::Store)?
            .ok_or_else(|| EngineError::Validation(format!("unknown market {market_id}")))?;

        let now = Utc::now();
        let can_resolve_manual = !market.resolved && now >= market.resolve_deadline;
        let can_resolve_timeout =
            !market.resolved && now >= market.resolve_deadline + self.grace_period;
        let can_resolve_oracle = !market.resolved
            && self
                .check_eligibility(&market, ResolutionTrigger::Oracle)
                .await
                .is_ok();

        Ok(ResolutionInfo {
            market_id: market.id,
            resolved: market.resolved,
            winning_outcome: market.winning_outcome,
            resolve_deadline: market.resolve_deadline,
            can_resolve_manual,
            can_resolve_oracle,
            can_resolve_timeout,
        })
    }

    /// Periodic fallback pass over every unresolved market past its deadline:
    /// oracle resolution first, timeout resolution once the grace period has
    /// elapsed. Ineligible markets are skipped quietly; they stay pending for
    /// the next sweep.
    pub async fn sweep(&self) -> Result<Vec<SettlementResult>, EngineError> {
        let pending = self
            .markets
            .unresolved_markets()
            .await
            .map_err(EngineError::Store)?;

        let now = Utc::now();
        let mut resolved = Vec::new();

        for market in pending {
            if now < market.resolve_deadline {
                continue;
            }

            let attempt = match self.oracle_resolve(&market.id, None).await {
                Ok(result) => Some(result),
                Err(e) if e.is_benign() => {
                    debug!(market_id = %market.id, error = %e, "Oracle sweep attempt skipped");
                    match self
                        .resolve(ResolutionRequest {
                            market_id: market.id.clone(),
                            trigger: ResolutionTrigger::Timeout,
                            winning_outcome: None,
                            resolver: None,
                        })
                        .await
                    {
                        Ok(result) => Some(result),
                        Err(e) if e.is_benign() => {
                            debug!(market_id = %market.id, error = %e, "Timeout sweep attempt skipped");
                            None
                        }
                        Err(e) => {
                            warn!(market_id = %market.id, error = %e, "Sweep resolution failed");
                            None
                        }
                    }
                }
                Err(e) => {
                    warn!(market_id = %market.id, error = %e, "Sweep resolution failed");
                    None
                }
            };

            if let Some(result) = attempt {
                resolved.push(result);
            }
        }

        if !resolved.is_empty() {
            info!(count = resolved.len(), "🧹 Sweep resolved markets");
        }

        Ok(resolved)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }
}

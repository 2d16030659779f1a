//! Subscription Registry
//!
//! Single source of truth for which oracle feed a market depends on. The
//! drain loop routes incoming notifications through `lookup_by_id`, and the
//! resolution engine consults `lookup` to decide whether a market has usable
//! oracle coverage at all.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::models::{FeedKind, Subscription, SubscriptionParams};

/// In-process registry of market -> oracle feed links.
///
/// Constructor-injected and owned by the app state; a concurrent map keyed
/// by subscription id is sufficient since no cross-key invariants exist
/// beyond the one-active-per-(market, kind) rule enforced on registration.
pub struct SubscriptionRegistry {
    subs: RwLock<HashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subs: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new feed link for a market.
    ///
    /// Fails with `DuplicateSubscription` if an active subscription already
    /// exists for the same (market, feed kind) pair.
    pub fn register(
        &self,
        market_id: &str,
        feed_kind: FeedKind,
        params: SubscriptionParams,
    ) -> Result<Subscription, EngineError> {
        if market_id.trim().is_empty() {
            return Err(EngineError::Validation("market id is required".into()));
        }
        if params.feed.trim().is_empty() {
            return Err(EngineError::Validation("feed is required".into()));
        }

        let mut subs = self.subs.write();
        let duplicate = subs
            .values()
            .any(|s| s.active && s.market_id == market_id && s.feed_kind == feed_kind);
        if duplicate {
            return Err(EngineError::DuplicateSubscription {
                market_id: market_id.to_string(),
                feed_kind,
            });
        }

        let sub = Subscription {
            id: Uuid::new_v4().to_string(),
            market_id: market_id.to_string(),
            feed: params.feed,
            feed_kind,
            threshold_pct: params.threshold_pct,
            heartbeat_secs: params.heartbeat_secs,
            active: true,
            created_at: Utc::now(),
            last_heartbeat: None,
        };
        subs.insert(sub.id.clone(), sub.clone());

        info!(
            market_id = %sub.market_id,
            subscription_id = %sub.id,
            feed = %sub.feed,
            "📡 Subscription registered"
        );

        Ok(sub)
    }

    /// Active subscription for a market, price feeds preferred when a market
    /// carries both kinds.
    pub fn lookup(&self, market_id: &str) -> Option<Subscription> {
        let subs = self.subs.read();
        let mut found: Option<&Subscription> = None;
        for s in subs.values() {
            if !s.active || s.market_id != market_id {
                continue;
            }
            if s.feed_kind == FeedKind::Price {
                return Some(s.clone());
            }
            found = Some(s);
        }
        found.cloned()
    }

    pub fn lookup_by_id(&self, subscription_id: &str) -> Option<Subscription> {
        self.subs.read().get(subscription_id).cloned()
    }

    /// Deactivate every active subscription for a market. Idempotent.
    pub fn deactivate(&self, market_id: &str) {
        let mut subs = self.subs.write();
        let mut count = 0;
        for s in subs.values_mut() {
            if s.active && s.market_id == market_id {
                s.active = false;
                count += 1;
            }
        }
        if count > 0 {
            info!(market_id, count, "Subscriptions deactivated");
        }
    }

    /// Record a heartbeat notification. Returns false for unknown ids.
    pub fn record_heartbeat(&self, subscription_id: &str) -> bool {
        let mut subs = self.subs.write();
        match subs.get_mut(subscription_id) {
            Some(s) => {
                s.last_heartbeat = Some(Utc::now());
                debug!(subscription_id, "Heartbeat recorded");
                true
            }
            None => false,
        }
    }

    pub fn active_subscriptions(&self) -> Vec<Subscription> {
        self.subs
            .read()
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

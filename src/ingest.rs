//! Oracle Event Ingestion Queue
//!
//! Webhook delivery is unordered, delayed, and at-least-once, so the HTTP
//! handler only parks the notification here and acks immediately. A single
//! drain pass (ticker-driven, non-reentrant) dispatches queued events, and
//! transient handler failures go onto a delayed-retry heap with a linear
//! backoff instead of being retried inline. All timing flows through the
//! `now` argument of `drain_at` so retry ordering is reproducible in tests.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::models::{EventKind, IncomingEvent, WebhookPayload};
use crate::resolution::ResolutionEngine;
use crate::subscriptions::SubscriptionRegistry;

/// Ack returned to the webhook sender.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueAck {
    pub event_id: String,
    /// True when the sender redelivered an id we already hold; the original
    /// entry is untouched.
    pub duplicate: bool,
}

/// Counters from one drain pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainStats {
    pub processed: usize,
    pub resolved: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Queue depth snapshot for the stats endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total_events: usize,
    pub pending: usize,
    pub delayed: usize,
    pub processed: usize,
    pub failed: usize,
    pub draining: bool,
}

/// Heap entry ordered by ready time; ties break on event id so two entries
/// with the same deadline always pop in the same order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RetryEntry {
    ready_at: DateTime<Utc>,
    event_id: String,
}

pub struct IngestQueue {
    engine: Arc<ResolutionEngine>,
    registry: Arc<SubscriptionRegistry>,
    events: RwLock<HashMap<String, IncomingEvent>>,
    pending: Mutex<VecDeque<String>>,
    delayed: Mutex<BinaryHeap<Reverse<RetryEntry>>>,
    draining: AtomicBool,
    max_retries: u32,
    base_retry_delay: Duration,
    retention: Duration,
}

impl IngestQueue {
    pub fn new(
        engine: Arc<ResolutionEngine>,
        registry: Arc<SubscriptionRegistry>,
        max_retries: u32,
        base_retry_delay: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            engine,
            registry,
            events: RwLock::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            delayed: Mutex::new(BinaryHeap::new()),
            draining: AtomicBool::new(false),
            max_retries,
            base_retry_delay,
            retention,
        }
    }

    /// Accept a webhook notification. Deduplicates on the sender-supplied
    /// event id; payloads without one get a local id and cannot be
    /// deduplicated against later redeliveries.
    pub fn enqueue(&self, payload: WebhookPayload) -> Result<EnqueueAck, EngineError> {
        if payload.subscription_id.trim().is_empty() {
            return Err(EngineError::Validation(
                "subscription id is required".to_string(),
            ));
        }

        let event_id = payload
            .event_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut events = self.events.write();
        if events.contains_key(&event_id) {
            debug!(event_id, "Duplicate event ignored");
            return Ok(EnqueueAck {
                event_id,
                duplicate: true,
            });
        }

        let kind = EventKind::from_wire(&payload.event_type, payload.data.as_ref());
        events.insert(
            event_id.clone(),
            IncomingEvent {
                id: event_id.clone(),
                subscription_id: payload.subscription_id,
                kind,
                received_at: Utc::now(),
                retry_count: 0,
                processed: false,
                last_error: None,
            },
        );
        drop(events);

        self.pending.lock().push_back(event_id.clone());
        debug!(event_id, "Event queued");

        Ok(EnqueueAck {
            event_id,
            duplicate: false,
        })
    }

    /// One drain pass at the current time.
    pub async fn drain(&self) -> DrainStats {
        self.drain_at(Utc::now()).await
    }

    /// One drain pass. Non-reentrant: a pass that finds another one running
    /// returns empty stats and lets the ticker try again. Events whose retry
    /// deadline has arrived are promoted back into the pending queue first.
    pub async fn drain_at(&self, now: DateTime<Utc>) -> DrainStats {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain already in progress, skipping");
            return DrainStats::default();
        }

        let mut stats = DrainStats::default();

        {
            // Lock order is pending then delayed, everywhere.
            let mut pending = self.pending.lock();
            let mut delayed = self.delayed.lock();
            while delayed
                .peek()
                .map_or(false, |Reverse(e)| e.ready_at <= now)
            {
                if let Some(Reverse(entry)) = delayed.pop() {
                    pending.push_back(entry.event_id);
                }
            }
        }

        // Snapshot the batch up front; retries scheduled during this pass
        // land on the delayed heap, not back into this loop.
        let batch: Vec<String> = self.pending.lock().drain(..).collect();

        for event_id in batch {
            let Some(event) = self.events.read().get(&event_id).cloned() else {
                continue;
            };
            if event.processed {
                continue;
            }
            self.process_one(event, now, &mut stats).await;
        }

        self.draining.store(false, Ordering::Release);

        if stats.processed + stats.retried + stats.failed > 0 {
            info!(
                processed = stats.processed,
                resolved = stats.resolved,
                retried = stats.retried,
                failed = stats.failed,
                "Drain pass complete"
            );
        }

        stats
    }

    async fn process_one(&self, event: IncomingEvent, now: DateTime<Utc>, stats: &mut DrainStats) {
        match &event.kind {
            EventKind::Heartbeat => {
                if !self.registry.record_heartbeat(&event.subscription_id) {
                    warn!(
                        event_id = %event.id,
                        subscription_id = %event.subscription_id,
                        "Heartbeat for unknown subscription"
                    );
                }
                self.finish(&event.id, None);
                stats.processed += 1;
            }
            EventKind::Unknown { raw } => {
                // Not retry-worthy: redelivery would decode the same way.
                warn!(event_id = %event.id, event_type = %raw, "Unknown event type dropped");
                self.finish(&event.id, Some(format!("unknown event type '{raw}'")));
                stats.processed += 1;
                stats.failed += 1;
            }
            EventKind::PriceUpdate { .. } | EventKind::ThresholdBreach { .. } => {
                self.try_resolve(&event, None, now, stats).await;
            }
            EventKind::EventData { outcome } => {
                self.try_resolve(&event, outcome.clone(), now, stats).await;
            }
        }
    }

    /// Route a notification to its market and attempt an oracle resolution.
    /// Benign engine errors (not yet due, already resolved, stale data) count
    /// as successful processing; only operational faults earn a retry.
    async fn try_resolve(
        &self,
        event: &IncomingEvent,
        proposed_outcome: Option<String>,
        now: DateTime<Utc>,
        stats: &mut DrainStats,
    ) {
        let Some(sub) = self.registry.lookup_by_id(&event.subscription_id) else {
            warn!(
                event_id = %event.id,
                subscription_id = %event.subscription_id,
                "Event for unknown subscription dropped"
            );
            self.finish(&event.id, Some("unknown subscription".to_string()));
            stats.processed += 1;
            stats.failed += 1;
            return;
        };

        match self
            .engine
            .oracle_resolve(&sub.market_id, proposed_outcome)
            .await
        {
            Ok(result) => {
                info!(
                    event_id = %event.id,
                    market_id = %result.market_id,
                    winning_outcome = %result.winning_outcome,
                    "Event triggered resolution"
                );
                self.finish(&event.id, None);
                stats.processed += 1;
                stats.resolved += 1;
            }
            Err(e) if e.is_benign() => {
                debug!(event_id = %event.id, market_id = %sub.market_id, reason = %e, "Event processed without resolution");
                self.finish(&event.id, None);
                stats.processed += 1;
            }
            Err(e) => {
                self.schedule_retry(&event.id, &e.to_string(), now, stats);
            }
        }
    }

    /// Linear backoff: the nth retry waits n times the base delay. Once the
    /// retry budget is spent the event is parked as permanently failed.
    fn schedule_retry(&self, event_id: &str, error: &str, now: DateTime<Utc>, stats: &mut DrainStats) {
        let mut events = self.events.write();
        let Some(event) = events.get_mut(event_id) else {
            return;
        };

        event.retry_count += 1;
        event.last_error = Some(error.to_string());

        if event.retry_count < self.max_retries {
            let delay = self.base_retry_delay * event.retry_count as i32;
            let ready_at = now + delay;
            self.delayed.lock().push(Reverse(RetryEntry {
                ready_at,
                event_id: event_id.to_string(),
            }));
            warn!(
                event_id,
                retry_count = event.retry_count,
                delay_ms = delay.num_milliseconds(),
                error,
                "Event processing failed, retry scheduled"
            );
            stats.retried += 1;
        } else {
            event.processed = true;
            warn!(
                event_id,
                retry_count = event.retry_count,
                error,
                "⚠️ Event permanently failed"
            );
            stats.processed += 1;
            stats.failed += 1;
        }
    }

    fn finish(&self, event_id: &str, error: Option<String>) {
        let mut events = self.events.write();
        if let Some(event) = events.get_mut(event_id) {
            event.processed = true;
            event.last_error = error;
        }
    }

    /// Drop processed events older than the retention window. Unprocessed
    /// events are kept regardless of age.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now())
    }

    pub fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|_, e| !e.processed || e.received_at > cutoff);
        let removed = before - events.len();
        if removed > 0 {
            info!(removed, "Expired events cleaned up");
        }
        removed
    }

    /// Re-queue every permanently failed event with a fresh retry budget.
    /// Operator escape hatch for after an outage is fixed.
    pub fn replay_failed(&self) -> usize {
        let mut events = self.events.write();
        let mut pending = self.pending.lock();
        let mut count = 0;
        for event in events.values_mut() {
            if event.processed && event.last_error.is_some() {
                event.processed = false;
                event.retry_count = 0;
                pending.push_back(event.id.clone());
                count += 1;
            }
        }
        if count > 0 {
            info!(count, "Failed events requeued for replay");
        }
        count
    }

    /// Events that exhausted their retries or were dropped at dispatch.
    pub fn failed_events(&self) -> Vec<IncomingEvent> {
        self.events
            .read()
            .values()
            .filter(|e| e.processed && e.last_error.is_some())
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        // One lock at a time; holding any of these across another
        // acquisition would race the drain pass.
        let (total_events, processed, failed) = {
            let events = self.events.read();
            let failed = events
                .values()
                .filter(|e| e.processed && e.last_error.is_some())
                .count();
            let processed = events.values().filter(|e| e.processed).count();
            (events.len(), processed, failed)
        };
        let pending = self.pending.lock().len();
        let delayed = self.delayed.lock().len();
        QueueStats {
            total_events,
            pending,
            delayed,
            processed,
            failed,
            draining: self.draining.load(Ordering::Acquire),
        }
    }
}

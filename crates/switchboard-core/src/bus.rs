//! Central event bus: storage, subscription matching, delivery, retry,
//! overflow backlogs, dead letters and metrics.
//!
//! Delivery of one event:
//!
//! ```text
//! publish ─► store ─► match active subscriptions (registration order)
//!              │
//!              ▼ per subscription
//!        slot free? ── no ──► overflow policy (skip | queue | reject ─► dead letter)
//!              │ yes
//!              ▼
//!        handler ── Err ──► retry policy ── exhausted ──► dead letter
//!              │ Ok(Some(follow_up))
//!              ▼
//!        follow-up events published after the delivery loop
//! ```
//!
//! No lock is held while a handler runs: the subscription table is read into
//! a snapshot of `Arc<Subscription>` before matching and delivery.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use switchboard_types::config::BusConfig;
use switchboard_types::event::{Event, EventType};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alert::{AlertSink, OperationalAlert, TracingAlertSink};
use crate::retry::RetryHandler;
use crate::store::{EventQuery, InMemoryEventStore, StoreError};
use crate::subscription::{Overflow, Subscription, SubscriptionInfo};

/// Tracing target for per-publish metric lines.
pub const METRICS_TARGET: &str = "switchboard::metrics";

/// Dead-letter reason recorded when a full backlog rejects an event.
pub const SATURATED_REASON: &str = "subscription saturated";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from bus operations. Handler failures are not among them.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to store event {event_id}: {source}")]
    Store {
        event_id: Uuid,
        #[source]
        source: StoreError,
    },

    #[error("batch aborted at index {index} (event {event_id}): {source}")]
    Batch {
        event_id: Uuid,
        index: usize,
        #[source]
        source: Box<BusError>,
    },

    #[error("subscription {subscription_id} is already registered")]
    DuplicateSubscription { subscription_id: String },

    #[error("subscription {subscription_id} not found")]
    SubscriptionNotFound { subscription_id: String },
}

impl BusError {
    /// The event this error concerns, if any.
    pub fn event_id(&self) -> Option<Uuid> {
        match self {
            BusError::Store { event_id, .. } | BusError::Batch { event_id, .. } => Some(*event_id),
            BusError::DuplicateSubscription { .. } | BusError::SubscriptionNotFound { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Dead letters and metrics
// ---------------------------------------------------------------------------

/// An event whose delivery to one subscription permanently failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub event: Event,
    pub subscription_id: Option<String>,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// The order in which one event reaches its matching subscriptions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOrder {
    /// Registration order. Event priority does not reorder delivery.
    #[default]
    Registration,
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMetrics {
    pub events_published: u64,
    pub events_delivered: u64,
    /// Net of failures later recovered by a successful retry.
    pub events_failed: u64,
    pub events_retried: u64,
    pub events_dead_lettered: u64,
    pub deliveries_skipped: u64,
    pub deliveries_queued: u64,
    pub deliveries_dropped: u64,
    pub events_expired: u64,
    pub events_replayed: u64,
    pub subscriptions_total: usize,
    pub subscriptions_active: usize,
    pub stored_events: usize,
    pub dead_letter_depth: usize,
    pub dead_letter_evictions: u64,
    pub uptime_seconds: f64,
    pub avg_delivery_ms: f64,
    pub max_delivery_ms: f64,
    pub events_by_type: BTreeMap<String, u64>,
    pub delivery_order: DeliveryOrder,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    skipped: AtomicU64,
    queued: AtomicU64,
    dropped: AtomicU64,
    expired: AtomicU64,
    replayed: AtomicU64,
    dead_letter_evictions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct LatencyStats {
    samples: u64,
    total: Duration,
    max: Duration,
}

impl LatencyStats {
    fn record(&mut self, elapsed: Duration) {
        self.samples += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
    }

    fn average_ms(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.total.as_secs_f64() * 1_000.0 / self.samples as f64
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// In-process publish/subscribe hub.
///
/// Share it as `Arc<EventBus>`; every method takes `&self`.
pub struct EventBus {
    config: BusConfig,
    store: InMemoryEventStore,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    dead_letters: Mutex<VecDeque<DeadLetterEntry>>,
    counters: Counters,
    latency: Mutex<LatencyStats>,
    events_by_type: DashMap<EventType, u64>,
    alerts: Arc<dyn AlertSink>,
    started_at: Instant,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let store = InMemoryEventStore::new(config.max_stored_events, config.store_full_policy);
        Self {
            config,
            store,
            subscriptions: RwLock::new(Vec::new()),
            dead_letters: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
            latency: Mutex::new(LatencyStats::default()),
            events_by_type: DashMap::new(),
            alerts: Arc::new(TracingAlertSink),
            started_at: Instant::now(),
        }
    }

    /// Route operational alerts to `sink` instead of the log.
    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = sink;
        self
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn delivery_order(&self) -> DeliveryOrder {
        DeliveryOrder::Registration
    }

    // -- publishing --------------------------------------------------------

    /// Store the event and deliver it to every active matching subscription.
    ///
    /// Subscriptions are visited in registration order; priority never
    /// reorders delivery. Handler failures are retried and dead-lettered
    /// here and never surface as errors. Events returned by handlers are
    /// published after the delivery loop; their failures are alerted and
    /// logged but do not fail this call.
    pub async fn publish(&self, event: Event) -> Result<(), BusError> {
        let follow_ups = self.dispatch(event, "publish").await?;
        Counters::bump(&self.counters.published, 1);
        self.publish_follow_ups(follow_ups).await;
        Ok(())
    }

    /// Publish several events; the first failure aborts the rest.
    ///
    /// The publish counter is updated once, with the number of events that
    /// went through before any abort.
    pub async fn publish_batch(&self, events: Vec<Event>) -> Result<Vec<Uuid>, BusError> {
        let mut ids = Vec::with_capacity(events.len());
        let mut follow_ups = Vec::new();
        let mut failure = None;

        for (index, event) in events.into_iter().enumerate() {
            let event_id = event.id();
            match self.dispatch(event, "publish_batch").await {
                Ok(more) => {
                    ids.push(event_id);
                    follow_ups.extend(more);
                }
                Err(source) => {
                    failure = Some(BusError::Batch {
                        event_id,
                        index,
                        source: Box::new(source),
                    });
                    break;
                }
            }
        }

        Counters::bump(&self.counters.published, ids.len() as u64);
        debug!(published = ids.len(), aborted = failure.is_some(), "batch published");
        self.publish_follow_ups(follow_ups).await;

        match failure {
            Some(err) => Err(err),
            None => Ok(ids),
        }
    }

    /// Store + match + deliver one event. Returns handler follow-ups.
    async fn dispatch(&self, mut event: Event, operation: &str) -> Result<Vec<Event>, BusError> {
        let event_id = event.id();
        if event.metadata.published_at.is_none() {
            event.mark_published();
        }

        if self.config.persist_events
            && let Err(source) = self.store.insert(event.clone()).await
        {
            let err = BusError::Store { event_id, source };
            self.alerts
                .raise(OperationalAlert::new(operation, Some(event_id), err.to_string()));
            return Err(err);
        }
        *self.events_by_type.entry(event.event_type()).or_insert(0) += 1;

        if event.is_expired(Utc::now()) {
            Counters::bump(&self.counters.expired, 1);
            debug!(%event_id, "event expired before delivery");
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let subscriptions = self.matching_subscriptions(&event).await;
        let matched = subscriptions.len();
        let follow_ups = self.deliver(event.clone(), &subscriptions).await;
        let elapsed = started.elapsed();
        self.latency.lock().await.record(elapsed);

        info!(
            target: METRICS_TARGET,
            %event_id,
            event_type = %event.event_type(),
            event_name = %event.name(),
            matched,
            duration_us = elapsed.as_micros() as u64,
            "event published"
        );
        Ok(follow_ups)
    }

    pub(crate) async fn publish_follow_ups(&self, follow_ups: Vec<Event>) {
        let mut pending: VecDeque<Event> = follow_ups.into();
        while let Some(event) = pending.pop_front() {
            let event_id = event.id();
            match self.dispatch(event, "publish").await {
                Ok(more) => {
                    Counters::bump(&self.counters.published, 1);
                    pending.extend(more);
                }
                Err(err) => warn!(%event_id, error = %err, "follow-up event not published"),
            }
        }
    }

    // -- delivery ----------------------------------------------------------

    async fn matching_subscriptions(&self, event: &Event) -> Vec<Arc<Subscription>> {
        let snapshot: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|sub| sub.is_active())
            .cloned()
            .collect();

        let mut matched = Vec::with_capacity(snapshot.len());
        for sub in snapshot {
            if sub.matches(event).await {
                matched.push(sub);
            }
        }
        matched
    }

    /// Deliver `event` to each subscription. Each delivery works on its own
    /// copy so one subscription's retries do not spend another's budget.
    async fn deliver(&self, mut event: Event, subscriptions: &[Arc<Subscription>]) -> Vec<Event> {
        event.mark_delivered();
        let mut follow_ups = Vec::new();

        for sub in subscriptions {
            if !sub.is_active() {
                continue;
            }
            match sub.try_acquire() {
                Some(permit) => {
                    follow_ups.extend(self.run_handler(sub, event.clone()).await);
                    drop(permit);
                    follow_ups.extend(self.drain_backlog(sub).await);
                }
                None => follow_ups.extend(self.overflow(sub, event.clone()).await),
            }
        }
        follow_ups
    }

    async fn overflow(&self, sub: &Arc<Subscription>, event: Event) -> Vec<Event> {
        let event_id = event.id();
        match sub.offer(event).await {
            Overflow::Skipped => {
                Counters::bump(&self.counters.skipped, 1);
                debug!(%event_id, subscription_id = %sub.id(), "subscription saturated, delivery skipped");
                Vec::new()
            }
            Overflow::Queued => {
                Counters::bump(&self.counters.queued, 1);
                debug!(%event_id, subscription_id = %sub.id(), "subscription saturated, event queued");
                // The slot holder may have finished draining before this push.
                self.drain_backlog(sub).await
            }
            Overflow::DroppedOldest(dropped) => {
                Counters::bump(&self.counters.queued, 1);
                Counters::bump(&self.counters.dropped, 1);
                warn!(
                    event_id = %dropped.id(),
                    subscription_id = %sub.id(),
                    "backlog full, oldest queued event dropped"
                );
                self.drain_backlog(sub).await
            }
            Overflow::Rejected(rejected) => {
                warn!(%event_id, subscription_id = %sub.id(), "backlog full, event rejected");
                self.dead_letter(rejected, Some(sub.id().to_string()), SATURATED_REASON.to_string())
                    .await;
                Vec::new()
            }
        }
    }

    /// Deliver queued events while a slot can be taken. Stops when the
    /// backlog is empty, another delivery holds every slot, or the
    /// subscription is paused.
    pub(crate) async fn drain_backlog(&self, sub: &Arc<Subscription>) -> Vec<Event> {
        let mut follow_ups = Vec::new();
        loop {
            if !sub.is_active() || sub.backlog_len().await == 0 {
                break;
            }
            let Some(permit) = sub.try_acquire() else {
                break;
            };
            while sub.is_active() {
                let Some(queued) = sub.next_queued().await else {
                    break;
                };
                follow_ups.extend(self.run_handler(sub, queued).await);
            }
            drop(permit);
        }
        follow_ups
    }

    /// Invoke the handler, retrying per the retry policy, and dead-letter
    /// the event once attempts are exhausted.
    async fn run_handler(&self, sub: &Subscription, mut event: Event) -> Option<Event> {
        let policy = &self.config.retry;
        let mut attempt: u32 = 1;

        loop {
            event.mark_processing();
            match (sub.handler())(event.clone()).await {
                Ok(response) => {
                    event.mark_completed();
                    Counters::bump(&self.counters.delivered, 1);
                    if attempt > 1 {
                        self.counters
                            .failed
                            .fetch_sub(u64::from(attempt - 1), Ordering::Relaxed);
                    }
                    self.record_outcome(&event);
                    debug!(event_id = %event.id(), subscription_id = %sub.id(), attempt, "event handled");
                    return response.map(|r| Self::stamp_follow_up(r, &event, sub));
                }
                Err(err) => {
                    event.mark_failed();
                    Counters::bump(&self.counters.failed, 1);
                    warn!(
                        event_id = %event.id(),
                        subscription_id = %sub.id(),
                        attempt,
                        error = %err,
                        "handler failed"
                    );

                    if RetryHandler::should_retry(policy, attempt, &event) && event.increment_retry() {
                        Counters::bump(&self.counters.retried, 1);
                        let delay = RetryHandler::delay_for(policy, attempt);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        attempt += 1;
                        continue;
                    }

                    self.record_outcome(&event);
                    self.dead_letter(event, Some(sub.id().to_string()), err.to_string())
                        .await;
                    return None;
                }
            }
        }
    }

    /// Write the delivery outcome back to the stored event. Replayed copies
    /// never overwrite the original.
    fn record_outcome(&self, event: &Event) {
        if !event.metadata.is_replay {
            self.store.update(event);
        }
    }

    fn stamp_follow_up(mut follow_up: Event, cause: &Event, sub: &Subscription) -> Event {
        let meta = &mut follow_up.metadata;
        if meta.causation_id.is_none() {
            meta.causation_id = Some(cause.id());
        }
        if meta.correlation_id.is_none() {
            meta.correlation_id = cause.metadata.correlation_id.clone();
        }
        if meta.source.is_empty() {
            meta.source = sub.subscriber_id().to_string();
        }
        follow_up
    }

    async fn dead_letter(&self, event: Event, subscription_id: Option<String>, reason: String) {
        let event_id = event.id();
        let mut letters = self.dead_letters.lock().await;
        while !letters.is_empty() && letters.len() >= self.config.max_dead_letters {
            if let Some(evicted) = letters.pop_front() {
                Counters::bump(&self.counters.dead_letter_evictions, 1);
                warn!(event_id = %evicted.event.id(), "dead-letter store full, oldest entry evicted");
            }
        }
        if self.config.max_dead_letters == 0 {
            Counters::bump(&self.counters.dead_letter_evictions, 1);
        } else {
            letters.push_back(DeadLetterEntry {
                event,
                subscription_id: subscription_id.clone(),
                reason: reason.clone(),
                failed_at: Utc::now(),
            });
        }
        Counters::bump(&self.counters.dead_lettered, 1);
        warn!(%event_id, subscription_id = ?subscription_id, %reason, "event dead-lettered");
    }

    // -- subscriptions -----------------------------------------------------

    /// Append a subscription to the table. Ids must be unique.
    pub async fn register_subscription(&self, subscription: Arc<Subscription>) -> Result<(), BusError> {
        let mut table = self.subscriptions.write().await;
        if table.iter().any(|s| s.id() == subscription.id()) {
            return Err(BusError::DuplicateSubscription {
                subscription_id: subscription.id().to_string(),
            });
        }
        debug!(
            subscription_id = %subscription.id(),
            subscriber_id = %subscription.subscriber_id(),
            "registered subscription"
        );
        table.push(subscription);
        Ok(())
    }

    /// Remove a subscription. Returns the removed entry, or `None` if unknown.
    ///
    /// The removed subscription is deactivated so deliveries already in
    /// flight skip it.
    pub async fn unregister_subscription(&self, subscription_id: &str) -> Option<Arc<Subscription>> {
        let mut table = self.subscriptions.write().await;
        let index = table.iter().position(|s| s.id() == subscription_id)?;
        let removed = table.remove(index);
        removed.set_active(false);
        debug!(%subscription_id, "unregistered subscription");
        Some(removed)
    }

    /// Look up one subscription.
    pub async fn subscription(&self, subscription_id: &str) -> Result<Arc<Subscription>, BusError> {
        self.subscriptions
            .read()
            .await
            .iter()
            .find(|s| s.id() == subscription_id)
            .cloned()
            .ok_or_else(|| BusError::SubscriptionNotFound {
                subscription_id: subscription_id.to_string(),
            })
    }

    /// Snapshots of every subscription, or of one owner's, in registration order.
    pub async fn subscriptions(&self, subscriber_id: Option<&str>) -> Vec<SubscriptionInfo> {
        let table: Vec<Arc<Subscription>> = self.subscriptions.read().await.clone();
        let mut infos = Vec::with_capacity(table.len());
        for sub in table {
            if subscriber_id.is_none_or(|owner| owner == sub.subscriber_id()) {
                infos.push(sub.info().await);
            }
        }
        infos
    }

    // -- queries -----------------------------------------------------------

    pub fn get_event(&self, event_id: &Uuid) -> Option<Event> {
        self.store.get(event_id)
    }

    /// Stored events matching `query`, newest first.
    pub fn get_events(&self, query: &EventQuery) -> Vec<Event> {
        self.store.query(query)
    }

    /// Re-deliver stored events matching `query`, oldest first.
    ///
    /// Handlers receive copies marked `is_replay`; stored originals are not
    /// modified. Expired events are skipped and counted as expired. Events
    /// returned by handlers during a replay are discarded, since the
    /// original delivery already published them. Returns the number of
    /// events replayed.
    pub async fn replay_events(&self, query: &EventQuery) -> usize {
        let mut events = self.store.query(query);
        events.reverse();

        let now = Utc::now();
        let mut replayed = 0;
        for mut event in events {
            let event_id = event.id();
            if event.is_expired(now) {
                Counters::bump(&self.counters.expired, 1);
                debug!(%event_id, "expired event not replayed");
                continue;
            }
            event.metadata.is_replay = true;
            let subscriptions = self.matching_subscriptions(&event).await;
            debug!(%event_id, matched = subscriptions.len(), "replaying event");
            let discarded = self.deliver(event, &subscriptions).await.len();
            if discarded > 0 {
                debug!(%event_id, discarded, "replay follow-ups discarded");
            }
            Counters::bump(&self.counters.replayed, 1);
            replayed += 1;
        }
        replayed
    }

    /// Drop every stored event. Returns how many were removed.
    pub async fn clear_events(&self) -> usize {
        self.store.clear().await
    }

    // -- dead letters ------------------------------------------------------

    /// Up to `limit` dead-letter entries, oldest first.
    pub async fn get_dead_letter_events(&self, limit: usize) -> Vec<DeadLetterEntry> {
        self.dead_letters
            .lock()
            .await
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Remove the entry for `event_id` and publish its event again, as a
    /// regular (non-replay) event.
    ///
    /// Returns `Ok(false)` when no entry exists.
    pub async fn retry_dead_letter_event(&self, event_id: &Uuid) -> Result<bool, BusError> {
        let Some(mut entry) = self.take_dead_letter(event_id).await else {
            return Ok(false);
        };
        // A failed replay copy comes back as a live delivery.
        entry.event.metadata.is_replay = false;
        info!(%event_id, "retrying dead-lettered event");
        self.publish(entry.event).await?;
        Ok(true)
    }

    /// Remove the entry for `event_id` without re-publishing.
    pub async fn clear_dead_letter_event(&self, event_id: &Uuid) -> bool {
        let removed = self.take_dead_letter(event_id).await.is_some();
        if removed {
            debug!(%event_id, "cleared dead-lettered event");
        }
        removed
    }

    async fn take_dead_letter(&self, event_id: &Uuid) -> Option<DeadLetterEntry> {
        let mut letters = self.dead_letters.lock().await;
        let index = letters.iter().position(|e| e.event.id() == *event_id)?;
        letters.remove(index)
    }

    // -- metrics -----------------------------------------------------------

    pub async fn get_metrics(&self) -> BusMetrics {
        let (subscriptions_total, subscriptions_active) = {
            let table = self.subscriptions.read().await;
            (table.len(), table.iter().filter(|s| s.is_active()).count())
        };
        let dead_letter_depth = self.dead_letters.lock().await.len();
        let (avg_delivery_ms, max_delivery_ms) = {
            let latency = self.latency.lock().await;
            (latency.average_ms(), latency.max.as_secs_f64() * 1_000.0)
        };
        let events_by_type = self
            .events_by_type
            .iter()
            .map(|entry| (entry.key().to_string(), *entry.value()))
            .collect();

        let c = &self.counters;
        BusMetrics {
            events_published: Counters::read(&c.published),
            events_delivered: Counters::read(&c.delivered),
            events_failed: Counters::read(&c.failed),
            events_retried: Counters::read(&c.retried),
            events_dead_lettered: Counters::read(&c.dead_lettered),
            deliveries_skipped: Counters::read(&c.skipped),
            deliveries_queued: Counters::read(&c.queued),
            deliveries_dropped: Counters::read(&c.dropped),
            events_expired: Counters::read(&c.expired),
            events_replayed: Counters::read(&c.replayed),
            subscriptions_total,
            subscriptions_active,
            stored_events: self.store.len(),
            dead_letter_depth,
            dead_letter_evictions: Counters::read(&c.dead_letter_evictions),
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            avg_delivery_ms,
            max_delivery_ms,
            events_by_type,
            delivery_order: self.delivery_order(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("store", &self.store)
            .field("published", &Counters::read(&self.counters.published))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::MemoryAlertSink;
    use crate::filter::{CompositeFilter, EventFilter, TypeFilter};
    use crate::subscription::{HandlerError, OverflowPolicy, QueueFullPolicy, handler_fn};
    use serde_json::Map;
    use std::sync::atomic::AtomicUsize;
    use switchboard_types::config::{RetryConfig, StoreFullPolicy};
    use switchboard_types::event::EventStatus;
    use tokio::sync::Notify;

    fn fast_config() -> BusConfig {
        BusConfig {
            retry: RetryConfig::immediate(2),
            ..BusConfig::default()
        }
    }

    fn counting_subscription(
        id: &str,
        filter: impl EventFilter + 'static,
        calls: Arc<AtomicUsize>,
    ) -> Arc<Subscription> {
        let handler = handler_fn(move |_event| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        });
        Arc::new(Subscription::new(id, "test", Arc::new(filter), handler))
    }

    fn failing_subscription(id: &str, calls: Arc<AtomicUsize>) -> Arc<Subscription> {
        let handler = handler_fn(move |_event| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::new("boom"))
            }
        });
        Arc::new(Subscription::new(id, "test", Arc::new(CompositeFilter::all()), handler))
    }

    #[tokio::test]
    async fn publish_stores_and_delivers_to_matching_only() {
        let bus = EventBus::new(fast_config());
        let queries = Arc::new(AtomicUsize::new(0));
        let commands = Arc::new(AtomicUsize::new(0));
        bus.register_subscription(counting_subscription(
            "q",
            TypeFilter::new([EventType::Query]),
            Arc::clone(&queries),
        ))
        .await
        .unwrap();
        bus.register_subscription(counting_subscription(
            "c",
            TypeFilter::new([EventType::Command]),
            Arc::clone(&commands),
        ))
        .await
        .unwrap();

        let event = Event::query("price", Map::new());
        let id = event.id();
        bus.publish(event).await.unwrap();

        assert_eq!(queries.load(Ordering::SeqCst), 1);
        assert_eq!(commands.load(Ordering::SeqCst), 0);
        let stored = bus.get_event(&id).unwrap();
        assert_eq!(stored.status(), EventStatus::Completed);

        let metrics = bus.get_metrics().await;
        assert_eq!(metrics.events_published, 1);
        assert_eq!(metrics.events_delivered, 1);
        assert_eq!(metrics.events_by_type.get("query"), Some(&1));
    }

    #[tokio::test]
    async fn paused_subscription_receives_nothing() {
        let bus = EventBus::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = counting_subscription("s", CompositeFilter::all(), Arc::clone(&calls));
        bus.register_subscription(Arc::clone(&sub)).await.unwrap();

        sub.set_active(false);
        bus.publish(Event::notification("n", Map::new())).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(bus.get_metrics().await.subscriptions_active, 0);
    }

    #[tokio::test]
    async fn always_failing_handler_is_dead_lettered_after_two_attempts() {
        let bus = EventBus::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register_subscription(failing_subscription("f", Arc::clone(&calls)))
            .await
            .unwrap();

        let event = Event::command("c", Map::new()).with_max_retries(5);
        let id = event.id();
        bus.publish(event).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let letters = bus.get_dead_letter_events(10).await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].event.id(), id);
        assert_eq!(letters[0].event.metadata.retry_count, 1);
        assert_eq!(letters[0].event.status(), EventStatus::Failed);
        assert_eq!(letters[0].reason, "boom");
        assert_eq!(letters[0].subscription_id.as_deref(), Some("f"));

        let metrics = bus.get_metrics().await;
        assert_eq!(metrics.events_failed, 2);
        assert_eq!(metrics.events_retried, 1);
        assert_eq!(metrics.events_dead_lettered, 1);
    }

    #[tokio::test]
    async fn recovered_failure_is_net_corrected() {
        let bus = EventBus::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(HandlerError::new("transient"))
                } else {
                    Ok(None)
                }
            }
        });
        bus.register_subscription(Arc::new(Subscription::new(
            "s",
            "test",
            Arc::new(CompositeFilter::all()),
            handler,
        )))
        .await
        .unwrap();

        bus.publish(Event::command("c", Map::new())).await.unwrap();

        let metrics = bus.get_metrics().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.events_delivered, 1);
        assert_eq!(metrics.events_failed, 0);
        assert_eq!(metrics.events_dead_lettered, 0);
    }

    #[tokio::test]
    async fn zero_retry_budget_dead_letters_immediately() {
        let bus = EventBus::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register_subscription(failing_subscription("f", Arc::clone(&calls)))
            .await
            .unwrap();

        bus.publish(Event::command("c", Map::new()).with_max_retries(0))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.get_dead_letter_events(10).await.len(), 1);
    }

    #[tokio::test]
    async fn longer_retry_policy_uses_event_budget() {
        let bus = EventBus::new(BusConfig {
            retry: RetryConfig::immediate(10),
            ..BusConfig::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register_subscription(failing_subscription("f", Arc::clone(&calls)))
            .await
            .unwrap();

        bus.publish(Event::command("c", Map::new()).with_max_retries(3))
            .await
            .unwrap();
        // initial + 3 retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let letters = bus.get_dead_letter_events(1).await;
        assert_eq!(letters[0].event.metadata.retry_count, 3);
    }

    #[tokio::test]
    async fn store_rejection_surfaces_error_and_alert() {
        let sink = Arc::new(MemoryAlertSink::new());
        let bus = EventBus::new(BusConfig {
            max_stored_events: Some(1),
            store_full_policy: StoreFullPolicy::Reject,
            ..fast_config()
        })
        .with_alert_sink(sink.clone());

        bus.publish(Event::notification("a", Map::new())).await.unwrap();
        let second = Event::notification("b", Map::new());
        let second_id = second.id();
        let err = bus.publish(second).await.unwrap_err();

        assert_eq!(err.event_id(), Some(second_id));
        assert!(matches!(err, BusError::Store { .. }));
        assert_eq!(sink.alerts()[0].event_id, Some(second_id));
        assert_eq!(bus.get_metrics().await.events_published, 1);
    }

    #[tokio::test]
    async fn batch_aborts_on_first_failure() {
        let bus = EventBus::new(BusConfig {
            max_stored_events: Some(2),
            store_full_policy: StoreFullPolicy::Reject,
            ..fast_config()
        })
        .with_alert_sink(Arc::new(MemoryAlertSink::new()));

        let events: Vec<Event> = (0..4).map(|i| Event::notification(format!("n{i}"), Map::new())).collect();
        let third = events[2].id();
        let err = bus.publish_batch(events).await.unwrap_err();

        match err {
            BusError::Batch { event_id, index, .. } => {
                assert_eq!(event_id, third);
                assert_eq!(index, 2);
            }
            other => panic!("expected batch error, got {other:?}"),
        }
        assert_eq!(bus.get_metrics().await.events_published, 2);
    }

    #[tokio::test]
    async fn duplicate_subscription_id_is_rejected() {
        let bus = EventBus::default();
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register_subscription(counting_subscription("s", CompositeFilter::all(), calls.clone()))
            .await
            .unwrap();
        let err = bus
            .register_subscription(counting_subscription("s", CompositeFilter::all(), calls))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::DuplicateSubscription { .. }));
        assert!(bus.unregister_subscription("s").await.is_some());
        assert!(bus.unregister_subscription("s").await.is_none());
        assert!(matches!(
            bus.subscription("s").await,
            Err(BusError::SubscriptionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn expired_events_are_stored_but_not_delivered() {
        let bus = EventBus::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register_subscription(counting_subscription("s", CompositeFilter::all(), calls.clone()))
            .await
            .unwrap();

        let event = Event::notification("late", Map::new())
            .with_expires_at(Utc::now() - chrono::Duration::seconds(1));
        let id = event.id();
        bus.publish(event).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(bus.get_event(&id).is_some());
        assert_eq!(bus.get_metrics().await.events_expired, 1);
    }

    #[tokio::test]
    async fn handler_follow_up_is_published_with_causation() {
        let bus = EventBus::new(fast_config());
        let responder = handler_fn(|event: Event| async move {
            Ok(Some(Event::response(event.id(), serde_json::json!(42), true, None)))
        });
        bus.register_subscription(Arc::new(Subscription::new(
            "responder",
            "pricing",
            Arc::new(TypeFilter::new([EventType::Query])),
            responder,
        )))
        .await
        .unwrap();

        let query = Event::query("price", Map::new()).with_correlation_id("conv");
        let query_id = query.id();
        bus.publish(query).await.unwrap();

        let responses = bus.get_events(&EventQuery::default().with_event_type(EventType::Response));
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].metadata.causation_id, Some(query_id));
        assert_eq!(responses[0].metadata.correlation_id.as_deref(), Some("conv"));
        assert_eq!(responses[0].source(), "pricing");
        assert_eq!(bus.get_metrics().await.events_published, 2);
    }

    #[tokio::test]
    async fn replay_marks_copies_and_leaves_originals() {
        let bus = EventBus::new(fast_config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = handler_fn(move |event: Event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().await.push(event.metadata.is_replay);
                Ok(None)
            }
        });
        bus.register_subscription(Arc::new(Subscription::new(
            "s",
            "test",
            Arc::new(CompositeFilter::all()),
            handler,
        )))
        .await
        .unwrap();

        let event = Event::notification("n", Map::new());
        let id = event.id();
        bus.publish(event).await.unwrap();
        let replayed = bus.replay_events(&EventQuery::default()).await;

        assert_eq!(replayed, 1);
        assert_eq!(*seen.lock().await, vec![false, true]);
        assert!(!bus.get_event(&id).unwrap().metadata.is_replay);
        assert_eq!(bus.get_metrics().await.events_replayed, 1);
    }

    #[tokio::test]
    async fn failed_replay_retried_from_dead_letters_runs_as_live_event() {
        let bus = EventBus::new(fast_config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = handler_fn(move |event: Event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().await.push(event.metadata.is_replay);
                Err(HandlerError::new("boom"))
            }
        });
        bus.register_subscription(Arc::new(Subscription::new(
            "s",
            "test",
            Arc::new(CompositeFilter::all()),
            handler,
        )))
        .await
        .unwrap();

        let event = Event::command("c", Map::new());
        let id = event.id();
        bus.publish(event).await.unwrap();
        assert!(bus.clear_dead_letter_event(&id).await);

        bus.replay_events(&EventQuery::default()).await;
        let letters = bus.get_dead_letter_events(10).await;
        assert_eq!(letters.len(), 1);
        assert!(letters[0].event.metadata.is_replay);

        seen.lock().await.clear();
        assert!(bus.retry_dead_letter_event(&id).await.unwrap());
        assert_eq!(*seen.lock().await, vec![false, false]);

        let stored = bus.get_event(&id).unwrap();
        assert!(!stored.metadata.is_replay);
        assert_eq!(stored.status(), EventStatus::Failed);
        let letters = bus.get_dead_letter_events(10).await;
        assert!(!letters[0].event.metadata.is_replay);
    }

    #[tokio::test]
    async fn replay_skips_expired_events() {
        let bus = EventBus::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));
        bus.register_subscription(counting_subscription("s", CompositeFilter::all(), calls.clone()))
            .await
            .unwrap();

        let event = Event::notification("late", Map::new())
            .with_expires_at(Utc::now() - chrono::Duration::seconds(1));
        bus.publish(event).await.unwrap();

        assert_eq!(bus.replay_events(&EventQuery::default()).await, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let metrics = bus.get_metrics().await;
        assert_eq!(metrics.events_expired, 2);
        assert_eq!(metrics.events_replayed, 0);
    }

    #[tokio::test]
    async fn replay_does_not_republish_handler_follow_ups() {
        let bus = EventBus::new(fast_config());
        let responder = handler_fn(|event: Event| async move {
            Ok(Some(Event::response(event.id(), serde_json::json!(42), true, None)))
        });
        bus.register_subscription(Arc::new(Subscription::new(
            "responder",
            "pricing",
            Arc::new(TypeFilter::new([EventType::Query])),
            responder,
        )))
        .await
        .unwrap();

        bus.publish(Event::query("price", Map::new())).await.unwrap();
        assert_eq!(bus.replay_events(&EventQuery::default()).await, 2);

        let responses = bus.get_events(&EventQuery::default().with_event_type(EventType::Response));
        assert_eq!(responses.len(), 1);
        assert_eq!(bus.get_metrics().await.events_published, 2);
    }

    #[tokio::test]
    async fn queue_overflow_delivers_backlog_in_order() {
        let bus = Arc::new(EventBus::new(fast_config()));
        let gate = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let (g, s, o) = (Arc::clone(&gate), Arc::clone(&started), Arc::clone(&order));
        let handler = handler_fn(move |event: Event| {
            let (gate, started, order) = (Arc::clone(&g), Arc::clone(&s), Arc::clone(&o));
            async move {
                if event.name() == "first" {
                    started.notify_one();
                    gate.notified().await;
                }
                order.lock().await.push(event.name().to_string());
                Ok(None)
            }
        });
        let sub = Subscription::new("s", "test", Arc::new(CompositeFilter::all()), handler)
            .with_overflow(OverflowPolicy::Queue {
                capacity: 4,
                on_full: QueueFullPolicy::DropOldest,
            });
        bus.register_subscription(Arc::new(sub)).await.unwrap();

        let first_bus = Arc::clone(&bus);
        let first = tokio::spawn(async move {
            first_bus
                .publish(Event::notification("first", Map::new()))
                .await
        });
        started.notified().await;
        bus.publish(Event::notification("second", Map::new())).await.unwrap();
        bus.publish(Event::notification("third", Map::new())).await.unwrap();
        gate.notify_one();
        first.await.unwrap().unwrap();

        assert_eq!(*order.lock().await, vec!["first", "second", "third"]);
        let metrics = bus.get_metrics().await;
        assert_eq!(metrics.deliveries_queued, 2);
        assert_eq!(metrics.deliveries_skipped, 0);
    }

    #[tokio::test]
    async fn dead_letter_cap_evicts_oldest() {
        let bus = EventBus::new(BusConfig {
            max_dead_letters: 2,
            ..fast_config()
        });
        bus.register_subscription(failing_subscription("f", Arc::new(AtomicUsize::new(0))))
            .await
            .unwrap();

        let events: Vec<Event> = (0..3).map(|i| Event::command(format!("c{i}"), Map::new())).collect();
        let ids: Vec<Uuid> = events.iter().map(Event::id).collect();
        for event in events {
            bus.publish(event).await.unwrap();
        }

        let letters = bus.get_dead_letter_events(10).await;
        let kept: Vec<Uuid> = letters.iter().map(|e| e.event.id()).collect();
        assert_eq!(kept, vec![ids[1], ids[2]]);
        let metrics = bus.get_metrics().await;
        assert_eq!(metrics.dead_letter_evictions, 1);
        assert_eq!(metrics.events_dead_lettered, 3);
    }
}

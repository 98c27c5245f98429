//! Subscriptions: a filter, a handler, and a concurrency gate.
//!
//! `active_tasks` never exceeds `max_concurrent`: slots are taken with a
//! compare-and-swap in [`Subscription::try_acquire`] and released when the
//! returned [`DeliveryPermit`] drops.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use switchboard_types::event::Event;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::filter::EventFilter;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Failure reported by a subscription handler.
///
/// Handler failures never escape `publish`; they drive retry and dead-lettering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn from_error(err: &dyn std::error::Error) -> Self {
        Self::new(err.to_string())
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// What a handler produces: optionally a follow-up event for the bus to publish.
pub type HandlerResult = Result<Option<Event>, HandlerError>;

/// Type-erased async event handler.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Box an async closure into an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

// ---------------------------------------------------------------------------
// Overflow policy
// ---------------------------------------------------------------------------

/// What happens to a full backlog when another event arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueFullPolicy {
    #[default]
    DropOldest,
    /// Refuse the new event; the bus dead-letters it.
    Reject,
}

/// What happens to an event that arrives while every slot is busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Skip this subscription for the event. Counted, never retried.
    #[default]
    Skip,
    /// Park the event in a bounded FIFO backlog drained by the slot holder.
    /// A capacity of 0 is raised to 1.
    Queue {
        capacity: usize,
        on_full: QueueFullPolicy,
    },
}

/// Result of offering an event to a saturated subscription.
#[derive(Debug)]
pub enum Overflow {
    Skipped,
    Queued,
    /// Queued after evicting the oldest backlog entry.
    DroppedOldest(Event),
    Rejected(Event),
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Options accepted by `EventSubscriber::subscribe`.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Owner to record instead of the subscriber's own id.
    pub subscriber_id: Option<String>,
    pub max_concurrent: usize,
    pub overflow: OverflowPolicy,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            subscriber_id: None,
            max_concurrent: 1,
            overflow: OverflowPolicy::Skip,
        }
    }
}

impl SubscriptionOptions {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_subscriber_id(mut self, subscriber_id: impl Into<String>) -> Self {
        self.subscriber_id = Some(subscriber_id.into());
        self
    }
}

/// A registered (filter, handler) pair belonging to one subscriber.
pub struct Subscription {
    id: String,
    subscriber_id: String,
    filter: Arc<dyn EventFilter>,
    handler: EventHandler,
    is_active: AtomicBool,
    max_concurrent: usize,
    active_tasks: AtomicUsize,
    overflow: OverflowPolicy,
    backlog: Mutex<VecDeque<Event>>,
    created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        id: impl Into<String>,
        subscriber_id: impl Into<String>,
        filter: Arc<dyn EventFilter>,
        handler: EventHandler,
    ) -> Self {
        Self {
            id: id.into(),
            subscriber_id: subscriber_id.into(),
            filter,
            handler,
            is_active: AtomicBool::new(true),
            max_concurrent: 1,
            active_tasks: AtomicUsize::new(0),
            overflow: OverflowPolicy::Skip,
            backlog: Mutex::new(VecDeque::new()),
            created_at: Utc::now(),
        }
    }

    /// Concurrency limit, at least 1.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = match overflow {
            OverflowPolicy::Queue { capacity, on_full } => OverflowPolicy::Queue {
                capacity: capacity.max(1),
                on_full,
            },
            OverflowPolicy::Skip => OverflowPolicy::Skip,
        };
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    /// Set the active flag; returns the previous value.
    pub fn set_active(&self, active: bool) -> bool {
        self.is_active.swap(active, Ordering::AcqRel)
    }

    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::Acquire)
    }

    pub async fn matches(&self, event: &Event) -> bool {
        self.filter.matches(event).await
    }

    pub(crate) fn handler(&self) -> &EventHandler {
        &self.handler
    }

    /// Take a delivery slot if one is free.
    pub fn try_acquire(self: &Arc<Self>) -> Option<DeliveryPermit> {
        self.active_tasks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_concurrent).then_some(n + 1)
            })
            .ok()
            .map(|_| DeliveryPermit {
                subscription: Arc::clone(self),
            })
    }

    /// Apply the overflow policy to an event that found no free slot.
    pub(crate) async fn offer(&self, event: Event) -> Overflow {
        let OverflowPolicy::Queue { capacity, on_full } = self.overflow else {
            return Overflow::Skipped;
        };
        let mut backlog = self.backlog.lock().await;
        if backlog.len() < capacity {
            backlog.push_back(event);
            return Overflow::Queued;
        }
        match on_full {
            QueueFullPolicy::Reject => Overflow::Rejected(event),
            QueueFullPolicy::DropOldest => {
                let dropped = backlog.pop_front();
                backlog.push_back(event);
                match dropped {
                    Some(dropped) => Overflow::DroppedOldest(dropped),
                    None => Overflow::Queued,
                }
            }
        }
    }

    pub(crate) async fn next_queued(&self) -> Option<Event> {
        self.backlog.lock().await.pop_front()
    }

    pub async fn backlog_len(&self) -> usize {
        self.backlog.lock().await.len()
    }

    /// Point-in-time view for listings and metrics.
    pub async fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id.clone(),
            subscriber_id: self.subscriber_id.clone(),
            is_active: self.is_active(),
            max_concurrent: self.max_concurrent,
            active_tasks: self.active_tasks(),
            overflow: self.overflow,
            backlog_len: self.backlog_len().await,
            created_at: self.created_at,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("subscriber_id", &self.subscriber_id)
            .field("is_active", &self.is_active())
            .field("max_concurrent", &self.max_concurrent)
            .field("active_tasks", &self.active_tasks())
            .field("overflow", &self.overflow)
            .finish()
    }
}

/// A held delivery slot. Dropping it frees the slot.
pub struct DeliveryPermit {
    subscription: Arc<Subscription>,
}

impl Drop for DeliveryPermit {
    fn drop(&mut self) {
        self.subscription.active_tasks.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Snapshot of a subscription's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub subscriber_id: String,
    pub is_active: bool,
    pub max_concurrent: usize,
    pub active_tasks: usize,
    pub overflow: OverflowPolicy,
    pub backlog_len: usize,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::CompositeFilter;
    use serde_json::Map;

    fn subscription(overflow: OverflowPolicy, max_concurrent: usize) -> Arc<Subscription> {
        let handler = handler_fn(|_event| async { Ok(None) });
        Arc::new(
            Subscription::new("s_1", "s", Arc::new(CompositeFilter::all()), handler)
                .with_max_concurrent(max_concurrent)
                .with_overflow(overflow),
        )
    }

    fn event(name: &str) -> Event {
        Event::notification(name, Map::new())
    }

    #[test]
    fn permits_never_exceed_max_concurrent() {
        let sub = subscription(OverflowPolicy::Skip, 2);
        let first = sub.try_acquire();
        let second = sub.try_acquire();
        assert!(first.is_some() && second.is_some());
        assert!(sub.try_acquire().is_none());
        assert_eq!(sub.active_tasks(), 2);

        drop(first);
        assert_eq!(sub.active_tasks(), 1);
        assert!(sub.try_acquire().is_some());
    }

    #[test]
    fn zero_max_concurrent_is_clamped_to_one() {
        let sub = subscription(OverflowPolicy::Skip, 0);
        assert_eq!(sub.max_concurrent(), 1);
        assert!(sub.try_acquire().is_some());
    }

    #[test]
    fn set_active_reports_previous_state() {
        let sub = subscription(OverflowPolicy::Skip, 1);
        assert!(sub.set_active(false));
        assert!(!sub.set_active(false));
        assert!(!sub.is_active());
    }

    #[tokio::test]
    async fn skip_policy_never_queues() {
        let sub = subscription(OverflowPolicy::Skip, 1);
        assert!(matches!(sub.offer(event("a")).await, Overflow::Skipped));
        assert_eq!(sub.backlog_len().await, 0);
    }

    #[tokio::test]
    async fn queue_drop_oldest_evicts_head() {
        let sub = subscription(
            OverflowPolicy::Queue {
                capacity: 2,
                on_full: QueueFullPolicy::DropOldest,
            },
            1,
        );
        assert!(matches!(sub.offer(event("a")).await, Overflow::Queued));
        assert!(matches!(sub.offer(event("b")).await, Overflow::Queued));
        match sub.offer(event("c")).await {
            Overflow::DroppedOldest(dropped) => assert_eq!(dropped.name(), "a"),
            other => panic!("expected drop, got {other:?}"),
        }
        assert_eq!(sub.next_queued().await.map(|e| e.name().to_string()), Some("b".into()));
        assert_eq!(sub.next_queued().await.map(|e| e.name().to_string()), Some("c".into()));
        assert!(sub.next_queued().await.is_none());
    }

    #[tokio::test]
    async fn zero_capacity_queue_keeps_the_incoming_event() {
        let sub = subscription(
            OverflowPolicy::Queue {
                capacity: 0,
                on_full: QueueFullPolicy::DropOldest,
            },
            1,
        );
        assert_eq!(
            sub.info().await.overflow,
            OverflowPolicy::Queue {
                capacity: 1,
                on_full: QueueFullPolicy::DropOldest,
            }
        );
        assert!(matches!(sub.offer(event("a")).await, Overflow::Queued));
        match sub.offer(event("b")).await {
            Overflow::DroppedOldest(dropped) => assert_eq!(dropped.name(), "a"),
            other => panic!("expected drop, got {other:?}"),
        }
        assert_eq!(sub.next_queued().await.map(|e| e.name().to_string()), Some("b".into()));
    }

    #[tokio::test]
    async fn queue_reject_returns_new_event() {
        let sub = subscription(
            OverflowPolicy::Queue {
                capacity: 1,
                on_full: QueueFullPolicy::Reject,
            },
            1,
        );
        sub.offer(event("a")).await;
        match sub.offer(event("b")).await {
            Overflow::Rejected(rejected) => assert_eq!(rejected.name(), "b"),
            other => panic!("expected reject, got {other:?}"),
        }
        assert_eq!(sub.backlog_len().await, 1);
    }

    #[tokio::test]
    async fn info_snapshot_reflects_state() {
        let sub = subscription(OverflowPolicy::Skip, 3);
        let _permit = sub.try_acquire();
        let info = sub.info().await;
        assert_eq!(info.id, "s_1");
        assert_eq!(info.active_tasks, 1);
        assert_eq!(info.max_concurrent, 3);
        assert!(info.is_active);
    }
}

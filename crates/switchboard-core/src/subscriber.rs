//! Subscriber facade: owns one consumer's subscriptions on the bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use switchboard_types::event::Event;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::bus::{BusError, EventBus};
use crate::filter::{CustomFilter, EventFilter};
use crate::subscription::{EventHandler, Subscription, SubscriptionInfo, SubscriptionOptions};

/// A subscription operation that the bus refused.
#[derive(Debug, Error)]
#[error("subscription {subscription_id} failed: {source}")]
pub struct SubscriptionError {
    pub subscription_id: String,
    #[source]
    pub source: BusError,
}

/// Creates, pauses, resumes and removes subscriptions for one consumer.
pub struct EventSubscriber {
    bus: Arc<EventBus>,
    subscriber_id: String,
    subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
    next_id: AtomicU64,
}

impl EventSubscriber {
    pub fn new(bus: Arc<EventBus>, subscriber_id: impl Into<String>) -> Self {
        Self {
            bus,
            subscriber_id: subscriber_id.into(),
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Register `handler` for events accepted by `filter`.
    ///
    /// The subscription id is `{subscriber_id}_{n}`. Numbers already
    /// registered on the bus, e.g. by another subscriber with the same id,
    /// are skipped.
    pub async fn subscribe(
        &self,
        filter: Arc<dyn EventFilter>,
        handler: EventHandler,
        options: SubscriptionOptions,
    ) -> Result<String, SubscriptionError> {
        let owner = options
            .subscriber_id
            .unwrap_or_else(|| self.subscriber_id.clone());

        // Another subscriber on the same bus may share this subscriber id;
        // skip numbers it already holds.
        let (subscription_id, subscription) = loop {
            let n = self.next_id.fetch_add(1, Ordering::Relaxed);
            let subscription_id = format!("{}_{n}", self.subscriber_id);
            let subscription = Arc::new(
                Subscription::new(
                    subscription_id.clone(),
                    owner.clone(),
                    Arc::clone(&filter),
                    Arc::clone(&handler),
                )
                .with_max_concurrent(options.max_concurrent)
                .with_overflow(options.overflow),
            );

            match self.bus.register_subscription(Arc::clone(&subscription)).await {
                Ok(()) => break (subscription_id, subscription),
                Err(BusError::DuplicateSubscription { .. }) => {
                    debug!(%subscription_id, "subscription id taken on the bus, trying next");
                }
                Err(source) => return Err(SubscriptionError { subscription_id, source }),
            }
        };
        self.subscriptions
            .write()
            .await
            .insert(subscription_id.clone(), subscription);

        debug!(%subscription_id, subscriber_id = %self.subscriber_id, "subscribed");
        Ok(subscription_id)
    }

    /// Subscribe with a plain boolean predicate.
    pub async fn subscribe_with_predicate<P>(
        &self,
        predicate: P,
        handler: EventHandler,
        options: SubscriptionOptions,
    ) -> Result<String, SubscriptionError>
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(CustomFilter::new(predicate)), handler, options)
            .await
    }

    /// Remove a subscription from the bus and from this subscriber.
    ///
    /// Returns `false` if this subscriber does not own `subscription_id`.
    pub async fn unsubscribe(&self, subscription_id: &str) -> bool {
        let Some(_) = self.subscriptions.write().await.remove(subscription_id) else {
            return false;
        };
        self.bus.unregister_subscription(subscription_id).await;
        debug!(%subscription_id, "unsubscribed");
        true
    }

    /// Stop deliveries without removing the subscription. Idempotent.
    pub async fn pause_subscription(&self, subscription_id: &str) -> bool {
        match self.subscriptions.read().await.get(subscription_id) {
            Some(sub) => {
                if sub.set_active(false) {
                    debug!(%subscription_id, "paused subscription");
                }
                true
            }
            None => false,
        }
    }

    /// Resume deliveries, draining any backlog queued while paused. Idempotent.
    pub async fn resume_subscription(&self, subscription_id: &str) -> bool {
        let Some(sub) = self.subscriptions.read().await.get(subscription_id).cloned() else {
            return false;
        };
        if !sub.set_active(true) {
            debug!(%subscription_id, "resumed subscription");
            let follow_ups = self.bus.drain_backlog(&sub).await;
            self.bus.publish_follow_ups(follow_ups).await;
        }
        true
    }

    /// Snapshots of this subscriber's subscriptions, optionally narrowed to
    /// those recorded under `subscriber_id`.
    pub async fn get_subscriptions(&self, subscriber_id: Option<&str>) -> Vec<SubscriptionInfo> {
        let owned: Vec<Arc<Subscription>> = self.subscriptions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(owned.len());
        for sub in owned {
            if subscriber_id.is_none_or(|id| id == sub.subscriber_id()) {
                infos.push(sub.info().await);
            }
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Unregister every owned subscription. Returns how many were removed.
    pub async fn close(&self) -> usize {
        let owned: Vec<String> = self.subscriptions.write().await.drain().map(|(id, _)| id).collect();
        for subscription_id in &owned {
            self.bus.unregister_subscription(subscription_id).await;
        }
        debug!(subscriber_id = %self.subscriber_id, removed = owned.len(), "subscriber closed");
        owned.len()
    }
}

impl std::fmt::Debug for EventSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscriber")
            .field("subscriber_id", &self.subscriber_id)
            .finish()
    }
}

//! In-memory event store backing `get_event`, `get_events` and replay.
//!
//! Lookups go straight to a `DashMap`; inserts additionally serialize on
//! an insertion-order queue so capacity eviction always removes the oldest
//! stored event.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use switchboard_types::config::StoreFullPolicy;
use switchboard_types::event::{Event, EventType};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Default cap on query results.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event store is full (capacity {capacity})")]
    Full { capacity: usize },
}

/// Criteria for [`InMemoryEventStore::query`]. Unset fields match everything.
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub event_type: Option<EventType>,
    pub source: Option<String>,
    pub target: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub end_time: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            event_type: None,
            source: None,
            target: None,
            start_time: None,
            end_time: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

impl EventQuery {
    pub fn with_event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn accepts(&self, event: &Event) -> bool {
        let meta = &event.metadata;
        self.event_type.is_none_or(|t| t == meta.event_type)
            && self.source.as_deref().is_none_or(|s| s == meta.source)
            && self
                .target
                .as_deref()
                .is_none_or(|t| meta.target.as_deref() == Some(t))
            && self.start_time.is_none_or(|start| meta.created_at >= start)
            && self.end_time.is_none_or(|end| meta.created_at <= end)
    }
}

/// Bounded or unbounded map of published events.
pub struct InMemoryEventStore {
    events: DashMap<Uuid, Event>,
    order: Mutex<VecDeque<Uuid>>,
    capacity: Option<usize>,
    policy: StoreFullPolicy,
}

impl InMemoryEventStore {
    pub fn new(capacity: Option<usize>, policy: StoreFullPolicy) -> Self {
        Self {
            events: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity,
            policy,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None, StoreFullPolicy::EvictOldest)
    }

    /// Store an event, replacing any earlier copy with the same id.
    ///
    /// Returns the evicted event when the store was full under `evict_oldest`.
    pub async fn insert(&self, event: Event) -> Result<Option<Event>, StoreError> {
        let id = event.id();
        let mut order = self.order.lock().await;

        if self.events.contains_key(&id) {
            self.events.insert(id, event);
            return Ok(None);
        }

        let mut evicted = None;
        if let Some(capacity) = self.capacity
            && order.len() >= capacity
        {
            match self.policy {
                StoreFullPolicy::Reject => return Err(StoreError::Full { capacity }),
                StoreFullPolicy::EvictOldest => {
                    if let Some(oldest) = order.pop_front() {
                        evicted = self.events.remove(&oldest).map(|(_, e)| e);
                        debug!(event_id = %oldest, "evicted oldest stored event");
                    }
                    if capacity == 0 {
                        return Ok(Some(event));
                    }
                }
            }
        }

        order.push_back(id);
        self.events.insert(id, event);
        Ok(evicted)
    }

    /// Overwrite the stored copy of `event`, if one is still stored.
    pub fn update(&self, event: &Event) -> bool {
        match self.events.get_mut(&event.id()) {
            Some(mut slot) => {
                *slot = event.clone();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, event_id: &Uuid) -> Option<Event> {
        self.events.get(event_id).map(|e| e.value().clone())
    }

    /// Matching events, newest first, truncated to `query.limit`.
    pub fn query(&self, query: &EventQuery) -> Vec<Event> {
        let mut matched: Vec<Event> = self
            .events
            .iter()
            .filter(|entry| query.accepts(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matched.sort_by(|a, b| {
            b.metadata
                .created_at
                .cmp(&a.metadata.created_at)
                .then_with(|| b.id().cmp(&a.id()))
        });
        matched.truncate(query.limit);
        matched
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub async fn clear(&self) -> usize {
        let mut order = self.order.lock().await;
        let removed = order.len();
        order.clear();
        self.events.clear();
        removed
    }
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("len", &self.events.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::Map;

    fn event_at(name: &str, offset_secs: i64) -> Event {
        let mut event = Event::notification(name, Map::new()).with_source("s");
        event.metadata.created_at = Utc::now() + Duration::seconds(offset_secs);
        event
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = InMemoryEventStore::unbounded();
        let event = event_at("a", 0);
        let id = event.id();
        store.insert(event).await.unwrap();
        assert_eq!(store.get(&id).map(|e| e.id()), Some(id));
        assert!(store.get(&Uuid::now_v7()).is_none());
    }

    #[tokio::test]
    async fn reinserting_same_id_replaces_without_growing() {
        let store = InMemoryEventStore::new(Some(2), StoreFullPolicy::Reject);
        let mut event = event_at("a", 0);
        store.insert(event.clone()).await.unwrap();
        event.mark_published();
        store.insert(event.clone()).await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get(&event.id()).unwrap().metadata.published_at.is_some());
    }

    #[tokio::test]
    async fn evict_oldest_policy() {
        let store = InMemoryEventStore::new(Some(2), StoreFullPolicy::EvictOldest);
        let first = event_at("a", 0);
        let first_id = first.id();
        store.insert(first).await.unwrap();
        store.insert(event_at("b", 1)).await.unwrap();
        let evicted = store.insert(event_at("c", 2)).await.unwrap();

        assert_eq!(evicted.map(|e| e.id()), Some(first_id));
        assert_eq!(store.len(), 2);
        assert!(store.get(&first_id).is_none());
    }

    #[tokio::test]
    async fn reject_policy() {
        let store = InMemoryEventStore::new(Some(1), StoreFullPolicy::Reject);
        store.insert(event_at("a", 0)).await.unwrap();
        let err = store.insert(event_at("b", 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Full { capacity: 1 }));
    }

    #[tokio::test]
    async fn query_filters_sorts_newest_first_and_limits() {
        let store = InMemoryEventStore::unbounded();
        store.insert(event_at("old", -10)).await.unwrap();
        store.insert(event_at("mid", -5)).await.unwrap();
        store.insert(event_at("new", 0)).await.unwrap();
        store
            .insert(Event::command("cmd", Map::new()).with_target("b"))
            .await
            .unwrap();

        let names: Vec<String> = store
            .query(&EventQuery::default().with_event_type(EventType::Notification).with_limit(2))
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        assert_eq!(names, vec!["new", "mid"]);

        let targeted = store.query(&EventQuery::default().with_target("b"));
        assert_eq!(targeted.len(), 1);

        let windowed = store.query(
            &EventQuery::default()
                .with_source("s")
                .between(Utc::now() - Duration::seconds(7), Utc::now() - Duration::seconds(3)),
        );
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].name(), "mid");
    }

    #[tokio::test]
    async fn clear_empties_store() {
        let store = InMemoryEventStore::unbounded();
        store.insert(event_at("a", 0)).await.unwrap();
        assert_eq!(store.clear().await, 1);
        assert!(store.is_empty());
    }
}

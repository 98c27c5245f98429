//! Typed publishing facade bound to one source id.

use std::sync::Arc;

use serde_json::{Map, Value};
use switchboard_types::event::{Event, EventPriority};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::bus::{BusError, EventBus};

/// A publish that the bus refused.
#[derive(Debug, Error)]
#[error("failed to publish event {event_id}: {source}")]
pub struct PublishError {
    pub event_id: Uuid,
    #[source]
    pub source: BusError,
}

/// Publishes events on behalf of one source.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    bus: Arc<EventBus>,
    source_id: String,
}

impl EventPublisher {
    pub fn new(bus: Arc<EventBus>, source_id: impl Into<String>) -> Self {
        Self {
            bus,
            source_id: source_id.into(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Stamp the source (if unset) and the published status.
    fn prepare(&self, mut event: Event) -> Event {
        if event.metadata.source.is_empty() {
            event.metadata.source = self.source_id.clone();
        }
        event.mark_published();
        event
    }

    /// Apply the bus-wide retry budget and an optional priority.
    fn typed(&self, event: Event, priority: Option<EventPriority>) -> Event {
        let event = event.with_max_retries(self.bus.config().default_max_retries);
        match priority {
            Some(priority) => event.with_priority(priority),
            None => event,
        }
    }

    pub async fn publish(&self, event: Event) -> Result<Uuid, PublishError> {
        let event = self.prepare(event);
        let event_id = event.id();
        self.bus
            .publish(event)
            .await
            .map_err(|source| PublishError { event_id, source })?;
        debug!(%event_id, source_id = %self.source_id, "published event");
        Ok(event_id)
    }

    pub async fn publish_command(
        &self,
        command_name: &str,
        parameters: Map<String, Value>,
        target: Option<&str>,
        priority: Option<EventPriority>,
    ) -> Result<Uuid, PublishError> {
        let mut event = self.typed(Event::command(command_name, parameters), priority);
        if let Some(target) = target {
            event = event.with_target(target);
        }
        self.publish(event).await
    }

    pub async fn publish_notification(
        &self,
        notification_name: &str,
        data: Map<String, Value>,
        priority: Option<EventPriority>,
    ) -> Result<Uuid, PublishError> {
        let event = self.typed(Event::notification(notification_name, data), priority);
        self.publish(event).await
    }

    pub async fn publish_query(
        &self,
        query_name: &str,
        parameters: Map<String, Value>,
        target: Option<&str>,
        priority: Option<EventPriority>,
    ) -> Result<Uuid, PublishError> {
        let mut event = self.typed(Event::query(query_name, parameters), priority);
        if let Some(target) = target {
            event = event.with_target(target);
        }
        self.publish(event).await
    }

    /// Answer the query `query_id`; the response's causation id is the query.
    pub async fn publish_response(
        &self,
        query_id: Uuid,
        response_data: Value,
        is_success: bool,
        error_message: Option<String>,
        correlation_id: Option<&str>,
        priority: Option<EventPriority>,
    ) -> Result<Uuid, PublishError> {
        let mut event = self.typed(
            Event::response(query_id, response_data, is_success, error_message),
            priority,
        );
        if let Some(correlation_id) = correlation_id {
            event = event.with_correlation_id(correlation_id);
        }
        self.publish(event).await
    }

    /// Report an error. Priority defaults to high.
    pub async fn publish_error(
        &self,
        error_code: &str,
        error_message: &str,
        source_event_id: Option<Uuid>,
        details: Map<String, Value>,
        priority: Option<EventPriority>,
    ) -> Result<Uuid, PublishError> {
        let event = self.typed(
            Event::error(error_code, error_message, source_event_id, details),
            priority,
        );
        self.publish(event).await
    }

    /// Stamp every event, then hand the batch to the bus.
    pub async fn publish_batch(&self, events: Vec<Event>) -> Result<Vec<Uuid>, PublishError> {
        let events: Vec<Event> = events.into_iter().map(|e| self.prepare(e)).collect();
        let first_id = events.first().map(Event::id).unwrap_or_else(Uuid::nil);
        self.bus.publish_batch(events).await.map_err(|source| PublishError {
            event_id: source.event_id().unwrap_or(first_id),
            source,
        })
    }
}

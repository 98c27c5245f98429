//! Event envelope, lifecycle state machine, and the five built-in event kinds.
//!
//! An [`Event`] is `metadata + payload`. The payload is a closed sum type
//! ([`EventPayload`]); on the wire it is a plain JSON object whose shape is
//! selected by `metadata.event_type`:
//!
//! ```text
//! {"metadata": {"event_id": ..., "event_type": "query", ...},
//!  "payload":  {"query_name": "price", "parameters": {...}}}
//! ```
//!
//! Lifecycle:
//!
//! ```text
//! created -> published -> delivered -> processing -> completed
//!                                      processing -> failed -> retrying -> processing
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::EventError;

/// Default per-event retry budget.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Schema version stamped on every new event.
pub const EVENT_VERSION: &str = "1.0";

/// Event name used for responses to queries.
pub const RESPONSE_EVENT_NAME: &str = "query_response";

/// Event name used for error events.
pub const ERROR_EVENT_NAME: &str = "error";

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// The five built-in event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Command,
    Notification,
    Query,
    Response,
    Error,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::Command,
        EventType::Notification,
        EventType::Query,
        EventType::Response,
        EventType::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Command => "command",
            EventType::Notification => "notification",
            EventType::Query => "query",
            EventType::Response => "response",
            EventType::Error => "error",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordinal event priority. Higher variants compare greater.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Urgent = 4,
    Critical = 5,
}

impl EventPriority {
    /// Numeric value (1 = low .. 5 = critical).
    pub fn value(self) -> u8 {
        self as u8
    }
}

/// Position of an event in its delivery lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[default]
    Created,
    Published,
    Delivered,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Created => "created",
            EventStatus::Published => "published",
            EventStatus::Delivered => "delivered",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::Retrying => "retrying",
        }
    }

    /// No further automatic transition happens from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Failed)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Envelope metadata shared by every event kind.
///
/// Immutable after creation except for `status`, `retry_count`, the
/// timestamps and the `is_replay` marker, which the bus maintains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: Uuid,
    /// Links a request to its response, or all events of one conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// The event that directly caused this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    pub event_type: EventType,
    pub event_name: String,
    pub version: String,
    /// Empty until stamped by a publisher.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub priority: EventPriority,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub status: EventStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub is_compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub custom: Map<String, Value>,
    /// Set on copies re-delivered by a replay; stored originals never carry it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_replay: bool,
}

impl EventMetadata {
    /// Fresh metadata in the `created` state.
    pub fn new(event_type: EventType, event_name: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            correlation_id: None,
            causation_id: None,
            event_type,
            event_name: event_name.into(),
            version: EVENT_VERSION.to_string(),
            source: String::new(),
            target: None,
            priority: EventPriority::default(),
            created_at: Utc::now(),
            published_at: None,
            expires_at: None,
            status: EventStatus::Created,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            is_compressed: false,
            size_bytes: None,
            conversation_id: None,
            user_id: None,
            decision_id: None,
            confidence: None,
            custom: Map::new(),
            is_replay: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Payload of a command event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    #[serde(default)]
    pub command_name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Additional top-level payload keys, e.g. the `agent_message` envelope.
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

/// Payload of a notification event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub notification_name: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Payload of a query event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPayload {
    pub query_name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Payload of a response to a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub query_id: Uuid,
    #[serde(default)]
    pub response_data: Value,
    pub is_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Payload of an error event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error_code: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event_id: Option<Uuid>,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Kind-specific event payload.
///
/// Serialized untagged: the discriminant lives in `metadata.event_type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Command(CommandPayload),
    Notification(NotificationPayload),
    Query(QueryPayload),
    Response(ResponsePayload),
    Error(ErrorPayload),
}

impl EventPayload {
    /// The event type this payload belongs to.
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::Command(_) => EventType::Command,
            EventPayload::Notification(_) => EventType::Notification,
            EventPayload::Query(_) => EventType::Query,
            EventPayload::Response(_) => EventType::Response,
            EventPayload::Error(_) => EventType::Error,
        }
    }

    /// Decode a raw JSON payload into the variant selected by `event_type`.
    pub fn decode(event_type: EventType, value: Value) -> Result<Self, EventError> {
        let mismatch = |source| EventError::PayloadMismatch { event_type, source };
        let payload = match event_type {
            EventType::Command => EventPayload::Command(serde_json::from_value(value).map_err(mismatch)?),
            EventType::Notification => {
                EventPayload::Notification(serde_json::from_value(value).map_err(mismatch)?)
            }
            EventType::Query => EventPayload::Query(serde_json::from_value(value).map_err(mismatch)?),
            EventType::Response => {
                EventPayload::Response(serde_json::from_value(value).map_err(mismatch)?)
            }
            EventType::Error => EventPayload::Error(serde_json::from_value(value).map_err(mismatch)?),
        };
        Ok(payload)
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Wire shape used while decoding, before the payload kind is known.
#[derive(Deserialize)]
struct RawEvent {
    metadata: EventMetadata,
    #[serde(default)]
    payload: Value,
}

impl TryFrom<RawEvent> for Event {
    type Error = EventError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let payload = EventPayload::decode(raw.metadata.event_type, raw.payload)?;
        Ok(Event {
            metadata: raw.metadata,
            payload,
        })
    }
}

/// An immutable record of something that happened or is being requested.
///
/// Construct through the kind-specific constructors ([`Event::command`],
/// [`Event::query`], ...), which keep `metadata.event_type` and the payload
/// variant in agreement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEvent")]
pub struct Event {
    pub metadata: EventMetadata,
    payload: EventPayload,
}

impl Event {
    fn from_payload(event_name: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            metadata: EventMetadata::new(payload.event_type(), event_name),
            payload,
        }
    }

    /// A command asking `target` (if set) to do something.
    pub fn command(command_name: impl Into<String>, parameters: Map<String, Value>) -> Self {
        let command_name = command_name.into();
        Self::from_payload(
            command_name.clone(),
            EventPayload::Command(CommandPayload {
                command_name,
                parameters,
                extensions: Map::new(),
            }),
        )
    }

    /// A fire-and-forget notification.
    pub fn notification(notification_name: impl Into<String>, data: Map<String, Value>) -> Self {
        let notification_name = notification_name.into();
        Self::from_payload(
            notification_name.clone(),
            EventPayload::Notification(NotificationPayload {
                notification_name,
                data,
            }),
        )
    }

    /// A query expecting a [`EventType::Response`].
    pub fn query(query_name: impl Into<String>, parameters: Map<String, Value>) -> Self {
        let query_name = query_name.into();
        Self::from_payload(
            query_name.clone(),
            EventPayload::Query(QueryPayload {
                query_name,
                parameters,
            }),
        )
    }

    /// A response to the query `query_id`. `causation_id` is set to `query_id`.
    pub fn response(
        query_id: Uuid,
        response_data: Value,
        is_success: bool,
        error_message: Option<String>,
    ) -> Self {
        let mut event = Self::from_payload(
            RESPONSE_EVENT_NAME,
            EventPayload::Response(ResponsePayload {
                query_id,
                response_data,
                is_success,
                error_message,
            }),
        );
        event.metadata.causation_id = Some(query_id);
        event
    }

    /// An error report. Defaults to high priority; `causation_id` is set to
    /// `source_event_id` when present.
    pub fn error(
        error_code: impl Into<String>,
        error_message: impl Into<String>,
        source_event_id: Option<Uuid>,
        details: Map<String, Value>,
    ) -> Self {
        let mut event = Self::from_payload(
            ERROR_EVENT_NAME,
            EventPayload::Error(ErrorPayload {
                error_code: error_code.into(),
                error_message: error_message.into(),
                source_event_id,
                details,
            }),
        );
        event.metadata.priority = EventPriority::High;
        event.metadata.causation_id = source_event_id;
        event
    }

    // -- builders ----------------------------------------------------------

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = source.into();
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.metadata.target = Some(target.into());
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.metadata.priority = priority;
        self
    }

    pub fn with_event_name(mut self, event_name: impl Into<String>) -> Self {
        self.metadata.event_name = event_name.into();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.metadata.causation_id = Some(causation_id);
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.metadata.expires_at = Some(expires_at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.metadata.max_retries = max_retries;
        self
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.metadata.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.metadata.user_id = Some(user_id.into());
        self
    }

    pub fn with_decision_id(mut self, decision_id: impl Into<String>) -> Self {
        self.metadata.decision_id = Some(decision_id.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.metadata.confidence = Some(confidence);
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.custom.insert(key.into(), value);
        self
    }

    /// Attach an extra top-level key to a command payload. No-op for other kinds.
    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        if let EventPayload::Command(command) = &mut self.payload {
            command.extensions.insert(key.into(), value);
        }
        self
    }

    // -- accessors ---------------------------------------------------------

    pub fn id(&self) -> Uuid {
        self.metadata.event_id
    }

    pub fn event_type(&self) -> EventType {
        self.metadata.event_type
    }

    pub fn name(&self) -> &str {
        &self.metadata.event_name
    }

    pub fn source(&self) -> &str {
        &self.metadata.source
    }

    pub fn target(&self) -> Option<&str> {
        self.metadata.target.as_deref()
    }

    pub fn priority(&self) -> EventPriority {
        self.metadata.priority
    }

    pub fn status(&self) -> EventStatus {
        self.metadata.status
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Whether the event has passed its `expires_at` deadline.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.metadata.expires_at.is_some_and(|deadline| deadline <= now)
    }

    // -- lifecycle ---------------------------------------------------------

    pub fn mark_published(&mut self) {
        self.metadata.status = EventStatus::Published;
        self.metadata.published_at = Some(Utc::now());
    }

    pub fn mark_delivered(&mut self) {
        self.metadata.status = EventStatus::Delivered;
    }

    pub fn mark_processing(&mut self) {
        self.metadata.status = EventStatus::Processing;
    }

    pub fn mark_completed(&mut self) {
        self.metadata.status = EventStatus::Completed;
    }

    pub fn mark_failed(&mut self) {
        self.metadata.status = EventStatus::Failed;
    }

    /// `retry_count < max_retries`.
    pub fn can_retry(&self) -> bool {
        self.metadata.retry_count < self.metadata.max_retries
    }

    /// Consume one unit of retry budget and move to `retrying`.
    ///
    /// Returns `false` (and changes nothing) once the budget is spent, so
    /// `retry_count` never exceeds `max_retries`.
    pub fn increment_retry(&mut self) -> bool {
        if !self.can_retry() {
            return false;
        }
        self.metadata.retry_count += 1;
        self.metadata.status = EventStatus::Retrying;
        true
    }

    // -- codec -------------------------------------------------------------

    pub fn to_value(&self) -> Result<Value, EventError> {
        serde_json::to_value(self).map_err(EventError::Encode)
    }

    pub fn from_value(value: Value) -> Result<Self, EventError> {
        serde_json::from_value(value).map_err(EventError::Decode)
    }

    pub fn serialize(&self) -> Result<String, EventError> {
        serde_json::to_string(self).map_err(EventError::Encode)
    }

    pub fn deserialize(json: &str) -> Result<Self, EventError> {
        serde_json::from_str(json).map_err(EventError::Decode)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Agent message envelope exchanged through the router.
//!
//! An [`AgentMessage`] travels over the bus as a command event named
//! [`AGENT_MESSAGE_EVENT`], with the message itself stored under the
//! top-level payload key [`AGENT_MESSAGE_KEY`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::MessageError;
use crate::event::{Event, EventPayload, EventPriority};

/// Event name used for every routed agent message.
pub const AGENT_MESSAGE_EVENT: &str = "agent_message";

/// Payload key holding the serialized [`AgentMessage`].
pub const AGENT_MESSAGE_KEY: &str = "agent_message";

/// Intent of an agent message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Command,
    Query,
    Response,
    Notification,
    Error,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Command => "command",
            MessageType::Query => "query",
            MessageType::Response => "response",
            MessageType::Notification => "notification",
            MessageType::Error => "error",
        };
        f.write_str(s)
    }
}

/// A point-to-point message between two registered agents.
///
/// Messages are values: fan-out and replies build new messages through
/// [`AgentMessage::with_receiver`] and [`AgentMessage::reply`] rather than
/// mutating a shared one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub message_id: String,
    pub message_type: MessageType,
    pub sender_id: String,
    pub receiver_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub content: Map<String, Value>,
    #[serde(default)]
    pub priority: EventPriority,
    /// Doubles as the conversation id.
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub action_required: bool,
}

impl AgentMessage {
    pub fn new(
        message_type: MessageType,
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        content: Map<String, Value>,
    ) -> Self {
        Self {
            message_id: Uuid::now_v7().to_string(),
            message_type,
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            timestamp: Utc::now(),
            content,
            priority: EventPriority::Normal,
            correlation_id: None,
            metadata: Map::new(),
            action_required: false,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn requiring_action(mut self) -> Self {
        self.action_required = true;
        self
    }

    /// Independent copy addressed to `receiver_id`, with a fresh `message_id`.
    pub fn with_receiver(&self, receiver_id: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::now_v7().to_string(),
            receiver_id: receiver_id.into(),
            ..self.clone()
        }
    }

    /// A response travelling back to the sender, in the same conversation.
    pub fn reply(&self, content: Map<String, Value>) -> Self {
        Self {
            message_id: Uuid::now_v7().to_string(),
            message_type: MessageType::Response,
            sender_id: self.receiver_id.clone(),
            receiver_id: self.sender_id.clone(),
            timestamp: Utc::now(),
            content,
            priority: self.priority,
            correlation_id: self.correlation_id.clone(),
            metadata: Map::new(),
            action_required: false,
        }
    }

    /// Whether `agent_id` is the sender or the receiver.
    pub fn involves(&self, agent_id: &str) -> bool {
        self.sender_id == agent_id || self.receiver_id == agent_id
    }

    /// Recover the message carried by a routed command event.
    ///
    /// When the envelope carries no correlation id the event's own
    /// correlation id is used.
    pub fn from_event(event: &Event) -> Result<Self, MessageError> {
        let EventPayload::Command(command) = event.payload() else {
            return Err(MessageError::MissingEnvelope);
        };
        let raw = command
            .extensions
            .get(AGENT_MESSAGE_KEY)
            .ok_or(MessageError::MissingEnvelope)?;
        let mut message: AgentMessage =
            serde_json::from_value(raw.clone()).map_err(MessageError::InvalidEnvelope)?;
        if message.correlation_id.is_none() {
            message.correlation_id = event.metadata.correlation_id.clone();
        }
        Ok(message)
    }
}

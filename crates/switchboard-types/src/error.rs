use thiserror::Error;

use crate::event::EventType;

/// Errors from encoding or decoding events.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode event: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("payload does not match event type '{event_type}': {source}")]
    PayloadMismatch {
        event_type: EventType,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from encoding or decoding agent messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("event carries no agent_message envelope")]
    MissingEnvelope,

    #[error("invalid agent_message envelope: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),
}

//! OpenTelemetry messaging semantic convention attribute names.
//!
//! Usable as constant field names in `tracing` span macros:
//! `info_span!("publish", { MESSAGING_SYSTEM } = SYSTEM_NAME)`.

/// Identifies the messaging system.
pub const MESSAGING_SYSTEM: &str = "messaging.system";

/// The kind of operation (`publish`, `process`, `receive`).
pub const MESSAGING_OPERATION_TYPE: &str = "messaging.operation.type";

/// Event name, used as the destination.
pub const MESSAGING_DESTINATION_NAME: &str = "messaging.destination.name";

/// Number of messages in a batch operation.
pub const MESSAGING_BATCH_MESSAGE_COUNT: &str = "messaging.batch.message_count";

// --- Values ---

pub const SYSTEM_NAME: &str = "switchboard";

pub const OP_PUBLISH: &str = "publish";

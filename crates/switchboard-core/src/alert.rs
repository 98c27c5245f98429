//! Operational alert side-channel for publish-level failures.
//!
//! Handler failures are handled by retry and dead-lettering and never raise
//! alerts; only infrastructure failures in `publish` do.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

/// A best-effort alert describing a failed bus operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationalAlert {
    /// Bus operation that failed (e.g. "publish").
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl OperationalAlert {
    pub fn new(operation: impl Into<String>, event_id: Option<Uuid>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            event_id,
            message: message.into(),
            raised_at: Utc::now(),
        }
    }
}

/// Receives operational alerts. Must not block.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: OperationalAlert);
}

/// Default sink: an `error!` log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: OperationalAlert) {
        match alert.event_id {
            Some(event_id) => error!(
                operation = %alert.operation,
                %event_id,
                "operational alert: {}",
                alert.message
            ),
            None => error!(operation = %alert.operation, "operational alert: {}", alert.message),
        }
    }
}

/// Keeps alerts in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<OperationalAlert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<OperationalAlert> {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AlertSink for MemoryAlertSink {
    fn raise(&self, alert: OperationalAlert) {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert);
    }
}

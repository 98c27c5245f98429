//! Configuration types for Switchboard.
//!
//! `SwitchboardConfig` is the top-level `config.toml`. Every field has a
//! default, so an empty file (or no file at all) yields a working bus.

use serde::{Deserialize, Serialize};

use crate::agent::AgentRecord;
use crate::event::DEFAULT_MAX_RETRIES;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub router: RouterConfig,

    /// Static agent directory consulted by broadcasts.
    #[serde(default)]
    pub agents: Vec<AgentRecord>,
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// What the event store does when `max_stored_events` is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFullPolicy {
    #[default]
    EvictOldest,
    Reject,
}

/// Event bus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Keep published events in the in-memory store for query and replay.
    #[serde(default = "default_true")]
    pub persist_events: bool,

    /// Store capacity. `None` means unbounded.
    #[serde(default)]
    pub max_stored_events: Option<usize>,

    #[serde(default)]
    pub store_full_policy: StoreFullPolicy,

    /// Dead-letter capacity; the oldest entry is evicted beyond it.
    #[serde(default = "default_max_dead_letters")]
    pub max_dead_letters: usize,

    /// Retry budget stamped on events built by the publisher's typed helpers.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_true() -> bool {
    true
}

fn default_max_dead_letters() -> usize {
    1024
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            persist_events: true,
            max_stored_events: None,
            store_full_policy: StoreFullPolicy::default(),
            max_dead_letters: default_max_dead_letters(),
            default_max_retries: default_max_retries(),
            retry: RetryConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Delay growth between handler attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Exponential,
}

/// Handler retry policy.
///
/// `max_attempts` counts the initial invocation, so the default of 2 means
/// one retry. Attempts also stop once the event's own retry budget
/// (`max_retries`) is exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: BackoffStrategy,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor for exponential backoff.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Same attempt budget, no waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Agent message router settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Cap on retained message history. `None` keeps everything.
    #[serde(default)]
    pub history_limit: Option<usize>,
}

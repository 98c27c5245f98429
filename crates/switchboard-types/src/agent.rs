//! Directory records describing known agents.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Availability of an agent as reported by an agent directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Active,
    Idle,
    Offline,
    #[serde(other)]
    Unknown,
}

impl AgentStatus {
    /// Only active agents receive broadcasts.
    pub fn is_active(&self) -> bool {
        matches!(self, AgentStatus::Active)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Active => "active",
            AgentStatus::Idle => "idle",
            AgentStatus::Offline => "offline",
            AgentStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One entry of an agent directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    /// Category used to narrow broadcasts (e.g. "pricing", "inventory").
    pub agent_type: String,
    #[serde(default)]
    pub status: AgentStatus,
}

impl AgentRecord {
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>, status: AgentStatus) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            status,
        }
    }
}

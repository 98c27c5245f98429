//! Agent directory backed by the `[[agents]]` table of the config file.

use switchboard_core::directory::AgentDirectory;
use switchboard_types::agent::AgentRecord;
use switchboard_types::config::SwitchboardConfig;

/// Fixed agent list, typically loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticAgentDirectory {
    agents: Vec<AgentRecord>,
}

impl StaticAgentDirectory {
    pub fn new(agents: Vec<AgentRecord>) -> Self {
        Self { agents }
    }

    pub fn from_config(config: &SwitchboardConfig) -> Self {
        Self::new(config.agents.clone())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl AgentDirectory for StaticAgentDirectory {
    fn agents(&self) -> Vec<AgentRecord> {
        self.agents.clone()
    }
}

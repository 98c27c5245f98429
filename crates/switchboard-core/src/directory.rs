//! Agent directory port consulted by router broadcasts.

use switchboard_types::agent::AgentRecord;

/// External view of which agents exist, their category and availability.
///
/// Implementations live outside the core (see `switchboard-infra`).
pub trait AgentDirectory: Send + Sync {
    fn agents(&self) -> Vec<AgentRecord>;

    /// Ids of active agents, narrowed to `category` when given.
    fn active_agent_ids(&self, category: Option<&str>) -> Vec<String> {
        self.agents()
            .into_iter()
            .filter(|record| record.status.is_active())
            .filter(|record| category.is_none_or(|c| c == record.agent_type))
            .map(|record| record.agent_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_types::agent::AgentStatus;

    struct Fixed(Vec<AgentRecord>);

    impl AgentDirectory for Fixed {
        fn agents(&self) -> Vec<AgentRecord> {
            self.0.clone()
        }
    }

    #[test]
    fn active_agent_ids_filters_status_and_category() {
        let directory = Fixed(vec![
            AgentRecord::new("p1", "pricing", AgentStatus::Active),
            AgentRecord::new("p2", "pricing", AgentStatus::Offline),
            AgentRecord::new("i1", "inventory", AgentStatus::Active),
        ]);

        assert_eq!(directory.active_agent_ids(Some("pricing")), vec!["p1"]);
        assert_eq!(directory.active_agent_ids(None), vec!["p1", "i1"]);
        assert!(directory.active_agent_ids(Some("shipping")).is_empty());
    }
}

use crate::model::AgentRecord;

/// Presence metadata carried by a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMeta {
    pub display_name: String,
    pub operator_label: String,
}

/// Who is in the fleet, in order of first join.
///
/// Records stay in a `Vec` so the presentation grid keeps its positions; fleets
/// are small enough that a linear lookup is cheaper than keeping an index
/// coherent with removals.
#[derive(Debug, Default, Clone)]
pub struct AgentRegistry {
    agents: Vec<AgentRecord>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the agent, or refreshes its presence metadata in place.
    /// Returns `true` when the agent was not registered before.
    pub fn upsert_joined(&mut self, agent_id: &str, meta: AgentMeta) -> bool {
        if let Some(existing) = self.find_mut(agent_id) {
            existing.display_name = meta.display_name;
            existing.operator_label = meta.operator_label;
            return false;
        }
        self.agents.push(AgentRecord {
            agent_id: agent_id.to_string(),
            display_name: meta.display_name,
            operator_label: meta.operator_label,
            deployed: false,
        });
        true
    }

    pub fn remove(&mut self, agent_id: &str) -> Option<AgentRecord> {
        let idx = self
            .agents
            .iter()
            .position(|agent| agent.agent_id == agent_id)?;
        Some(self.agents.remove(idx))
    }

    /// Returns `true` only if the flag actually changed. Unknown agents are left alone.
    pub fn set_deployed(&mut self, agent_id: &str, deployed: bool) -> bool {
        match self.find_mut(agent_id) {
            Some(agent) if agent.deployed != deployed => {
                agent.deployed = deployed;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentRecord> {
        self.agents.iter().find(|agent| agent.agent_id == agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.get(agent_id).is_some()
    }

    pub fn is_deployed(&self, agent_id: &str) -> bool {
        self.get(agent_id).map(|agent| agent.deployed).unwrap_or(false)
    }

    pub fn list(&self) -> &[AgentRecord] {
        &self.agents
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.agents.iter().map(|agent| agent.agent_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn clear(&mut self) {
        self.agents.clear();
    }

    fn find_mut(&mut self, agent_id: &str) -> Option<&mut AgentRecord> {
        self.agents
            .iter_mut()
            .find(|agent| agent.agent_id == agent_id)
    }
}

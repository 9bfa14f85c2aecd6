// Agent Registry
// Static agent_kind -> Agent map, populated once at process start. No
// reflection, no late registration.

use std::collections::HashMap;
use std::sync::Arc;

use agentbus_types::AgentKind;

use crate::{Agent, StageAgent};

#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<HashMap<AgentKind, Arc<dyn Agent>>>,
}

impl AgentRegistry {
    pub fn new(agents: HashMap<AgentKind, Arc<dyn Agent>>) -> Self {
        Self {
            agents: Arc::new(agents),
        }
    }

    /// The production pipeline: one stage agent per kind.
    pub fn default_pipeline() -> Self {
        let mut agents: HashMap<AgentKind, Arc<dyn Agent>> = HashMap::new();
        for kind in AgentKind::all() {
            agents.insert(kind, Arc::new(StageAgent::new(kind)));
        }
        Self::new(agents)
    }

    pub fn resolve(&self, kind: AgentKind) -> Option<Arc<dyn Agent>> {
        self.agents.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<AgentKind> {
        self.agents.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pipeline_covers_every_kind() {
        let registry = AgentRegistry::default_pipeline();
        for kind in AgentKind::all() {
            let agent = registry.resolve(kind).unwrap();
            assert_eq!(agent.kind(), kind);
        }
    }
}

//! The agent graph: which agents exist and who may hand off to whom.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::debug;

use crate::agents::{customer_support_agent, stylist_agent, triage_agent, AgentRecord, AgentSpec};
use crate::config::StorefrontConfig;
use crate::error::{Result, StorefrontError};
use crate::groups::{transfer_tool_name, AgentName, TRANSFER_TOOL_PREFIX};
use crate::mock_api::{MockOrderBackend, OrderBackend};

/// Validated set of agents with a designated starting agent.
///
/// Every handoff edge points at an agent in the graph, names are unique and
/// each name yields its own `transfer_to_*` tool.
#[derive(Debug, Clone)]
pub struct AgentGraph {
    agents: Vec<AgentSpec>,
    index: HashMap<AgentName, usize>,
    starting: usize,
}

impl AgentGraph {
    pub fn new(agents: Vec<AgentSpec>, starting_agent: &str) -> Result<Self> {
        let mut index = HashMap::with_capacity(agents.len());
        for (i, agent) in agents.iter().enumerate() {
            if index.insert(agent.name().to_string(), i).is_some() {
                return Err(StorefrontError::DuplicateAgent {
                    name: agent.name().to_string(),
                });
            }
        }
        let mut tool_owners: HashMap<String, &str> = HashMap::with_capacity(agents.len());
        for agent in &agents {
            let tool = transfer_tool_name(agent.name());
            if tool == TRANSFER_TOOL_PREFIX {
                return Err(StorefrontError::UnnamedHandoffTool {
                    name: agent.name().to_string(),
                });
            }
            if let Some(first) = tool_owners.insert(tool.clone(), agent.name()) {
                return Err(StorefrontError::HandoffToolCollision {
                    first: first.to_string(),
                    second: agent.name().to_string(),
                    tool,
                });
            }
        }
        for agent in &agents {
            if let Some(target) = agent.handoffs().iter().find(|t| !index.contains_key(*t)) {
                return Err(StorefrontError::UnknownHandoffTarget {
                    source_agent: agent.name().to_string(),
                    target: target.clone(),
                });
            }
        }
        let starting = *index
            .get(starting_agent)
            .ok_or_else(|| StorefrontError::UnknownStartingAgent {
                name: starting_agent.to_string(),
            })?;
        debug!(agents = agents.len(), starting = %starting_agent, "agent graph validated");
        Ok(Self {
            agents,
            index,
            starting,
        })
    }

    /// Triage, stylist and customer support, starting at triage.
    pub fn storefront(backend: Arc<dyn OrderBackend>, config: &StorefrontConfig) -> Result<Self> {
        let support = customer_support_agent(backend, config);
        let stylist = stylist_agent(config);
        let triage = triage_agent(config);
        let starting = triage.name().to_string();
        Self::new(vec![triage, stylist, support], &starting)
    }

    pub fn agent(&self, name: &str) -> Option<&AgentSpec> {
        self.index.get(name).map(|&i| &self.agents[i])
    }

    pub fn agents(&self) -> &[AgentSpec] {
        &self.agents
    }

    pub fn starting_agent(&self) -> &AgentSpec {
        &self.agents[self.starting]
    }

    pub fn handoff_targets(&self, name: &str) -> Option<&[AgentName]> {
        self.agent(name).map(AgentSpec::handoffs)
    }

    /// Every `(from, to)` handoff edge, in definition order.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.agents
            .iter()
            .flat_map(|a| a.handoffs().iter().map(move |t| (a.name(), t.as_str())))
            .collect()
    }

    pub fn can_hand_off(&self, from: &str, to: &str) -> bool {
        self.handoff_targets(from)
            .is_some_and(|targets| targets.iter().any(|t| t == to))
    }

    pub fn describe(&self) -> Vec<AgentRecord> {
        self.agents.iter().map(AgentSpec::record).collect()
    }
}

static STOREFRONT: Lazy<AgentGraph> = Lazy::new(|| {
    AgentGraph::storefront(
        Arc::new(MockOrderBackend::default()),
        &StorefrontConfig::default(),
    )
    .expect("storefront agent graph is statically valid")
});

/// Process-wide storefront graph over the mock backend and default config.
pub fn storefront_graph() -> &'static AgentGraph {
    &STOREFRONT
}

/// The conversation entry point of [`storefront_graph`].
pub fn starting_agent() -> &'static AgentSpec {
    STOREFRONT.starting_agent()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{CUSTOMER_SUPPORT_AGENT, STYLIST_AGENT, TRIAGE_AGENT};
    use pretty_assertions::assert_eq;

    #[test]
    fn storefront_edges() {
        let graph = storefront_graph();
        assert_eq!(
            graph.edges(),
            vec![
                (TRIAGE_AGENT, STYLIST_AGENT),
                (TRIAGE_AGENT, CUSTOMER_SUPPORT_AGENT),
                (STYLIST_AGENT, CUSTOMER_SUPPORT_AGENT),
            ]
        );
        assert_eq!(starting_agent().name(), TRIAGE_AGENT);
        assert!(!graph.can_hand_off(CUSTOMER_SUPPORT_AGENT, TRIAGE_AGENT));
        assert!(!graph.can_hand_off(STYLIST_AGENT, TRIAGE_AGENT));
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = AgentGraph::new(
            vec![AgentSpec::new("A", "x"), AgentSpec::new("A", "y")],
            "A",
        )
        .unwrap_err();
        assert!(matches!(err, StorefrontError::DuplicateAgent { name } if name == "A"));
    }

    #[test]
    fn rejects_dangling_handoff() {
        let err = AgentGraph::new(vec![AgentSpec::new("A", "x").with_handoff("B")], "A").unwrap_err();
        assert!(matches!(
            err,
            StorefrontError::UnknownHandoffTarget { ref source_agent, ref target }
                if source_agent == "A" && target == "B"
        ));
    }

    #[test]
    fn rejects_unknown_starting_agent() {
        let err = AgentGraph::new(vec![AgentSpec::new("A", "x")], "Z").unwrap_err();
        assert!(matches!(err, StorefrontError::UnknownStartingAgent { .. }));
    }

    #[test]
    fn rejects_names_sharing_a_transfer_tool() {
        let err = AgentGraph::new(
            vec![
                AgentSpec::new("Stylist Agent", "x"),
                AgentSpec::new("stylist-agent", "y"),
            ],
            "Stylist Agent",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StorefrontError::HandoffToolCollision { ref first, ref second, ref tool }
                if first == "Stylist Agent" && second == "stylist-agent" && tool == "transfer_to_stylist_agent"
        ));
    }

    #[test]
    fn rejects_names_without_ascii_alphanumerics() {
        let err = AgentGraph::new(
            vec![AgentSpec::new("A", "x"), AgentSpec::new("スタイリスト", "y")],
            "A",
        )
        .unwrap_err();
        assert!(matches!(err, StorefrontError::UnnamedHandoffTool { ref name } if name == "スタイリスト"));
    }

    #[test]
    fn allows_cycles() {
        let graph = AgentGraph::new(
            vec![
                AgentSpec::new("A", "x").with_handoff("B"),
                AgentSpec::new("B", "y").with_handoff("A"),
            ],
            "B",
        )
        .unwrap();
        assert!(graph.can_hand_off("A", "B"));
        assert!(graph.can_hand_off("B", "A"));
        assert_eq!(graph.starting_agent().name(), "B");
    }
}

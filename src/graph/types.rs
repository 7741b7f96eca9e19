use petgraph::stable_graph::NodeIndex;

use crate::schema::JoinMode;

/// Node weight in the built graph.
#[derive(Debug, Clone)]
pub struct GraphStep {
    pub name: String,
    pub class: String,
    pub join_mode: JoinMode,
}

/// Edge weight: the action label that activates this edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub action: String,
}

/// Step name to petgraph index mapping.
pub type StepIndexMap = std::collections::HashMap<String, NodeIndex>;

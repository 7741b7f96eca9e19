use std::collections::{BTreeSet, HashMap};

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;

use crate::error::WorkflowError;
use crate::schema::WorkflowSchema;

use super::types::{GraphEdge, GraphStep, StepIndexMap};

/// Built, validated form of a workflow graph.
#[derive(Debug)]
pub struct WorkflowGraph {
    pub graph: StableDiGraph<GraphStep, GraphEdge>,
    pub index: StepIndexMap,
}

impl WorkflowGraph {
    pub fn get_step(&self, name: &str) -> Result<&GraphStep, WorkflowError> {
        let idx = self.index_of(name)?;
        self.graph
            .node_weight(idx)
            .ok_or_else(|| WorkflowError::UnknownStep(name.to_string()))
    }

    /// Names of every step downstream of `name`, with the action label of
    /// the connecting edge.
    pub fn successors(&self, name: &str) -> Result<Vec<(String, String)>, WorkflowError> {
        let idx = self.index_of(name)?;
        Ok(self
            .graph
            .edges_directed(idx, petgraph::Direction::Outgoing)
            .filter_map(|e| {
                self.graph
                    .node_weight(e.target())
                    .map(|n| (e.weight().action.clone(), n.name.clone()))
            })
            .collect())
    }

    pub fn predecessors(&self, name: &str) -> Result<Vec<String>, WorkflowError> {
        let idx = self.index_of(name)?;
        Ok(self
            .graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
            .filter_map(|n| self.graph.node_weight(n).map(|node| node.name.clone()))
            .collect())
    }

    /// Steps with no incoming edges, in schema order.
    pub fn roots(&self) -> Vec<String> {
        let mut roots: Vec<String> = self
            .graph
            .node_indices()
            .filter(|idx| {
                self.graph
                    .neighbors_directed(*idx, petgraph::Direction::Incoming)
                    .next()
                    .is_none()
            })
            .filter_map(|idx| self.graph.node_weight(idx).map(|n| n.name.clone()))
            .collect();
        roots.sort();
        roots
    }

    /// Topological order of step names.
    pub fn topological_order(&self) -> Result<Vec<String>, WorkflowError> {
        let sorted =
            petgraph::algo::toposort(&self.graph, None).map_err(|_| WorkflowError::CycleDetected)?;
        Ok(sorted
            .into_iter()
            .filter_map(|idx| self.graph.node_weight(idx).map(|n| n.name.clone()))
            .collect())
    }

    fn index_of(&self, name: &str) -> Result<NodeIndex, WorkflowError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| WorkflowError::UnknownStep(name.to_string()))
    }
}

/// Build a [`WorkflowGraph`] from a schema and validate it.
///
/// Repeated edges with the same action are deduplicated. The same target
/// reached from one source through two different actions is rejected, as is
/// any reference to a step the schema does not define. Declared predecessor
/// sets must agree with the successor edges; an empty declaration is filled
/// in from the edges.
pub fn build_graph(schema: &WorkflowSchema) -> Result<WorkflowGraph, WorkflowError> {
    let mut graph = StableDiGraph::<GraphStep, GraphEdge>::new();
    let mut index: StepIndexMap = HashMap::new();

    for (name, step) in &schema.steps {
        let idx = graph.add_node(GraphStep {
            name: name.clone(),
            class: step.class.clone(),
            join_mode: step.join_mode,
        });
        index.insert(name.clone(), idx);
    }

    // Edges, deduplicated per (source, action, target); a target reachable
    // from the same source under two actions is ambiguous.
    let mut derived_preds: HashMap<String, BTreeSet<String>> = HashMap::new();
    for (name, step) in &schema.steps {
        let source_idx = index[name.as_str()];
        let mut seen: HashMap<&str, &str> = HashMap::new();
        for (action, target) in step.edges() {
            let target_idx = *index
                .get(target)
                .ok_or_else(|| WorkflowError::UnknownStep(target.to_string()))?;
            match seen.get(target) {
                Some(prev) if *prev == action => continue,
                Some(_) => {
                    return Err(WorkflowError::ConflictingEdge {
                        from: name.clone(),
                        to: target.to_string(),
                    })
                }
                None => {
                    seen.insert(target, action);
                }
            }
            graph.add_edge(
                source_idx,
                target_idx,
                GraphEdge {
                    action: action.to_string(),
                },
            );
            derived_preds
                .entry(target.to_string())
                .or_default()
                .insert(name.clone());
        }
    }

    // Reconcile declared predecessors with the edges.
    for (name, step) in &schema.steps {
        let derived = derived_preds.remove(name.as_str()).unwrap_or_default();
        if !step.predecessors.is_empty() && step.predecessors != derived {
            return Err(WorkflowError::SchemaParse(format!(
                "step '{name}' declares predecessors {:?} but edges imply {:?}",
                step.predecessors, derived
            )));
        }
        for pred in &step.predecessors {
            if !index.contains_key(pred.as_str()) {
                return Err(WorkflowError::UnknownStep(pred.clone()));
            }
        }
    }

    for output in &schema.outputs {
        if !index.contains_key(output.as_str()) {
            return Err(WorkflowError::UnknownStep(output.clone()));
        }
    }
    for (name, step) in &schema.steps {
        for binding in step.bindings.values() {
            if let Some(dep) = binding.dependency() {
                if !index.contains_key(dep) {
                    return Err(WorkflowError::UnknownStep(dep.to_string()));
                }
                if !schema.steps[dep].edges().any(|(_, t)| t == name) {
                    return Err(WorkflowError::SchemaParse(format!(
                        "step '{name}' binds to '{dep}' but no edge connects them"
                    )));
                }
            }
        }
    }

    let built = WorkflowGraph { graph, index };
    super::validator::validate_graph(&built)?;
    Ok(built)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Binding, StepSchema};
    use std::collections::BTreeMap;

    fn schema_with(steps: Vec<(&str, StepSchema)>) -> WorkflowSchema {
        WorkflowSchema {
            workflow_id: "wf".into(),
            version: "1".into(),
            steps: steps
                .into_iter()
                .map(|(n, s)| (n.to_string(), s))
                .collect::<BTreeMap<_, _>>(),
            outputs: vec![],
            input_keys: vec![],
        }
    }

    fn step() -> StepSchema {
        StepSchema::default()
    }

    fn step_to(action: &str, targets: &[&str]) -> StepSchema {
        let mut s = step();
        s.successors
            .insert(action.into(), targets.iter().map(|t| t.to_string()).collect());
        s
    }

    #[test]
    fn test_build_chain() {
        let schema = schema_with(vec![
            ("a", step_to("default", &["b"])),
            ("b", step_to("default", &["c"])),
            ("c", step()),
        ]);
        let graph = build_graph(&schema).unwrap();
        assert_eq!(graph.roots(), vec!["a"]);
        assert_eq!(graph.predecessors("c").unwrap(), vec!["b"]);
        assert_eq!(
            graph.successors("a").unwrap(),
            vec![("default".to_string(), "b".to_string())]
        );
        assert_eq!(graph.topological_order().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_duplicate_edges_are_deduplicated() {
        let schema = schema_with(vec![
            ("a", step_to("default", &["b", "b"])),
            ("b", step()),
        ]);
        let graph = build_graph(&schema).unwrap();
        assert_eq!(graph.successors("a").unwrap().len(), 1);
    }

    #[test]
    fn test_conflicting_actions_rejected() {
        let mut a = step_to("default", &["b"]);
        a.successors.insert("skip".into(), vec!["b".into()]);
        let schema = schema_with(vec![("a", a), ("b", step())]);
        assert!(matches!(
            build_graph(&schema),
            Err(WorkflowError::ConflictingEdge { .. })
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let schema = schema_with(vec![
            ("a", step_to("default", &["b"])),
            ("b", step_to("default", &["a"])),
        ]);
        assert!(matches!(
            build_graph(&schema),
            Err(WorkflowError::CycleDetected)
        ));
    }

    #[test]
    fn test_dangling_target_rejected() {
        let schema = schema_with(vec![("a", step_to("default", &["ghost"]))]);
        assert!(matches!(
            build_graph(&schema),
            Err(WorkflowError::UnknownStep(s)) if s == "ghost"
        ));
    }

    #[test]
    fn test_predecessor_mismatch_rejected() {
        let mut b = step();
        b.predecessors.insert("ghost".into());
        let schema = schema_with(vec![("a", step_to("default", &["b"])), ("b", b)]);
        assert!(build_graph(&schema).is_err());
    }

    #[test]
    fn test_binding_without_edge_rejected() {
        let mut b = step();
        b.bindings
            .insert("value".into(), Binding::step_output("a"));
        let schema = schema_with(vec![("a", step()), ("b", b)]);
        assert!(build_graph(&schema).is_err());
    }
}

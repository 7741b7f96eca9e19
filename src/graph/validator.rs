use crate::error::WorkflowError;

use super::builder::WorkflowGraph;

/// Reject graphs that cannot execute: the structure must be acyclic.
pub fn validate_graph(graph: &WorkflowGraph) -> Result<(), WorkflowError> {
    if petgraph::algo::is_cyclic_directed(&graph.graph) {
        return Err(WorkflowError::CycleDetected);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::builder::build_graph;
    use crate::error::WorkflowError;
    use crate::schema::{StepSchema, WorkflowSchema};

    #[test]
    fn test_self_loop_rejected() {
        let mut step = StepSchema::default();
        step.successors.insert("default".into(), vec!["a".into()]);
        let schema = WorkflowSchema {
            workflow_id: "wf".into(),
            version: "1".into(),
            steps: [("a".to_string(), step)].into_iter().collect(),
            outputs: vec![],
            input_keys: vec![],
        };
        assert!(matches!(
            build_graph(&schema),
            Err(WorkflowError::CycleDetected)
        ));
    }
}

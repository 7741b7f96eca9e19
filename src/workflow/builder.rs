use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::WorkflowError;
use crate::graph::build_graph;
use crate::policy::{StepPolicy, WorkflowPolicy};
use crate::schema::{StepSchema, WorkflowSchema, DEFAULT_ACTION};

use super::handler::Condition;
use super::step::StepDef;
use super::workflow::{Workflow, WorkflowInner};

/// Programmatic workflow construction.
///
/// Steps are declared with [`StepDef`]; edges either explicitly via
/// [`WorkflowBuilder::then`] / [`WorkflowBuilder::then_on`] or implicitly by
/// parameter bindings that reference another step.
pub struct WorkflowBuilder {
    workflow_id: String,
    version: String,
    steps: Vec<StepDef>,
    edges: Vec<(String, String, String)>,
    outputs: Vec<String>,
    input_keys: Vec<String>,
    policies: Vec<Arc<dyn WorkflowPolicy>>,
}

impl WorkflowBuilder {
    pub fn new(workflow_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            version: version.into(),
            steps: Vec::new(),
            edges: Vec::new(),
            outputs: Vec::new(),
            input_keys: Vec::new(),
            policies: Vec::new(),
        }
    }

    pub fn add_step(mut self, step: StepDef) -> Self {
        self.steps.push(step);
        self
    }

    /// `from` precedes `to` on the default action.
    pub fn then(self, from: &str, to: &str) -> Self {
        self.then_on(from, DEFAULT_ACTION, to)
    }

    /// `from` precedes `to` on the given action label.
    pub fn then_on(mut self, from: &str, action: &str, to: &str) -> Self {
        self.edges
            .push((from.to_string(), action.to_string(), to.to_string()));
        self
    }

    pub fn output(mut self, name: &str) -> Self {
        self.outputs.push(name.to_string());
        self
    }

    pub fn input_key(mut self, key: &str) -> Self {
        self.input_keys.push(key.to_string());
        self
    }

    pub fn policy(mut self, policy: Arc<dyn WorkflowPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    /// Assemble the schema, validate the graph and produce the runtime
    /// workflow.
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        let mut handlers = HashMap::new();
        let mut conditions: HashMap<String, Condition> = HashMap::new();
        let mut step_policies: HashMap<String, Vec<StepPolicy>> = HashMap::new();
        let mut steps: BTreeMap<String, StepSchema> = BTreeMap::new();

        let mut edges = self.edges;
        for def in &self.steps {
            // Bindings to other steps imply edges on the default action.
            for binding in def.bindings.values() {
                if let Some(dep) = binding.dependency() {
                    edges.push((dep.to_string(), DEFAULT_ACTION.to_string(), def.name.clone()));
                }
            }
        }

        for def in self.steps {
            if steps.contains_key(&def.name) {
                return Err(WorkflowError::DuplicateStep(def.name));
            }
            let policies = def.effective_policies();
            let schema = StepSchema {
                class: def.class.clone(),
                predecessors: Default::default(),
                successors: Default::default(),
                join_mode: def.join_mode,
                bindings: def.bindings.clone(),
                conditions: def.gate_names(),
                policies: policies.iter().filter_map(StepPolicy::to_config).collect(),
            };
            handlers.insert(def.name.clone(), def.handler.clone());
            for (name, condition) in &def.conditions {
                conditions.insert(name.clone(), condition.clone());
            }
            step_policies.insert(def.name.clone(), policies);
            steps.insert(def.name.clone(), schema);
        }

        for (from, action, to) in edges {
            let source = steps
                .get_mut(&from)
                .ok_or_else(|| WorkflowError::UnknownStep(from.clone()))?;
            let targets = source.successors.entry(action).or_default();
            if !targets.contains(&to) {
                targets.push(to);
            }
        }

        let schema = WorkflowSchema {
            workflow_id: self.workflow_id,
            version: self.version,
            steps,
            outputs: self.outputs,
            input_keys: self.input_keys,
        }
        .normalized();

        let graph = build_graph(&schema)?;
        Ok(Workflow::from_parts(WorkflowInner {
            schema,
            graph,
            handlers,
            conditions,
            step_policies,
            policies: self.policies,
        }))
    }
}

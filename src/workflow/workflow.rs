use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::engine::{ExecutionEngine, RunOutcome, SerialEngine};
use crate::error::WorkflowError;
use crate::graph::{build_graph, WorkflowGraph};
use crate::policy::{StepPolicy, WorkflowPolicy};
use crate::schema::WorkflowSchema;

use super::builder::WorkflowBuilder;
use super::handler::{Condition, StepHandler, StepRegistry};

pub(super) struct WorkflowInner {
    pub(super) schema: WorkflowSchema,
    pub(super) graph: WorkflowGraph,
    pub(super) handlers: HashMap<String, Arc<dyn StepHandler>>,
    pub(super) conditions: HashMap<String, Condition>,
    pub(super) step_policies: HashMap<String, Vec<StepPolicy>>,
    pub(super) policies: Vec<Arc<dyn WorkflowPolicy>>,
}

/// Runtime workflow: validated schema plus handlers, condition closures and
/// policies. Cheap to clone.
#[derive(Clone)]
pub struct Workflow {
    inner: Arc<WorkflowInner>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("workflow_id", &self.inner.schema.workflow_id)
            .finish_non_exhaustive()
    }
}

impl Workflow {
    pub fn builder(workflow_id: impl Into<String>, version: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(workflow_id, version)
    }

    /// Reconstruct a runtime workflow from a schema received over the wire.
    ///
    /// Handlers are resolved by each step's `class`; condition gates by name.
    /// Policies come from the schema's serialized configs.
    pub fn from_schema(
        schema: WorkflowSchema,
        registry: &StepRegistry,
    ) -> Result<Workflow, WorkflowError> {
        let schema = schema.normalized();
        let graph = build_graph(&schema)?;

        let mut handlers = HashMap::new();
        let mut conditions = HashMap::new();
        let mut step_policies = HashMap::new();
        for (name, step) in &schema.steps {
            let handler = registry
                .handler(&step.class)
                .ok_or_else(|| WorkflowError::UnknownHandler {
                    step: name.clone(),
                    class: step.class.clone(),
                })?;
            handlers.insert(name.clone(), handler);
            for cond_name in step.conditions.iter().chain(
                step.bindings.values().filter_map(|b| match b {
                    crate::schema::Binding::ConditionalStepOutput { condition, .. } => {
                        Some(condition)
                    }
                    _ => None,
                }),
            ) {
                let condition = registry
                    .condition(cond_name)
                    .ok_or_else(|| WorkflowError::UnknownCondition(cond_name.clone()))?;
                conditions.insert(cond_name.clone(), condition);
            }
            step_policies.insert(
                name.clone(),
                step.policies.iter().map(StepPolicy::from_config).collect(),
            );
        }

        Ok(Workflow::from_parts(WorkflowInner {
            schema,
            graph,
            handlers,
            conditions,
            step_policies,
            policies: Vec::new(),
        }))
    }

    pub(super) fn from_parts(inner: WorkflowInner) -> Workflow {
        Workflow {
            inner: Arc::new(inner),
        }
    }

    pub fn schema(&self) -> &WorkflowSchema {
        &self.inner.schema
    }

    /// The validated graph structure, for inspection and traversal.
    pub fn graph(&self) -> &WorkflowGraph {
        &self.inner.graph
    }

    pub fn workflow_id(&self) -> &str {
        &self.inner.schema.workflow_id
    }

    pub fn version(&self) -> &str {
        &self.inner.schema.version
    }

    pub fn handler(&self, step_name: &str) -> Option<Arc<dyn StepHandler>> {
        self.inner.handlers.get(step_name).cloned()
    }

    pub fn condition(&self, name: &str) -> Option<Condition> {
        self.inner.conditions.get(name).cloned()
    }

    pub fn step_policies(&self, step_name: &str) -> &[StepPolicy] {
        self.inner
            .step_policies
            .get(step_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn policies(&self) -> &[Arc<dyn WorkflowPolicy>] {
        &self.inner.policies
    }

    /// Dispatch-time condition gates of a step, resolved to closures.
    pub fn step_gates(&self, step_name: &str) -> Vec<Condition> {
        self.inner
            .schema
            .steps
            .get(step_name)
            .map(|step| {
                step.conditions
                    .iter()
                    .filter_map(|name| self.condition(name))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Execute the workflow in-process with the [`SerialEngine`].
    pub async fn run(
        &self,
        inputs: HashMap<String, Value>,
    ) -> Result<RunOutcome, WorkflowError> {
        SerialEngine::new().execute(self, inputs).await
    }
}

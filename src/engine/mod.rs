//! In-process execution engines.
//!
//! All three engines drive the same scheduling core — a
//! [`Broker`](crate::broker::Broker) over an in-memory store — so ordering,
//! branching and cancellation behave exactly as they do behind a network
//! broker; only the scheduling substrate differs:
//!
//! - [`SerialEngine`] runs one step at a time and backs
//!   [`Workflow::run`](crate::workflow::Workflow::run);
//! - [`PoolEngine`] runs up to `n` steps concurrently on tokio tasks;
//! - [`AsyncEngine`] cooperatively fans out every ready step on one task.

mod async_engine;
mod pool;
mod serial;

pub use async_engine::AsyncEngine;
pub use pool::PoolEngine;
pub use serial::SerialEngine;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::broker::Broker;
use crate::error::{WorkflowError, WorkflowResult};
use crate::runtime::RuntimeContext;
use crate::status::Status;
use crate::storage::{MemoryRuntimeStore, RuntimeStore};
use crate::workflow::Workflow;

/// Result of an in-process run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub instance_id: String,
    pub status: Status,
    /// Results of the schema's output steps, in declared order. A step that
    /// never produced a result (cancelled, skipped, failed) yields `None`.
    pub outputs: Vec<(String, Option<Value>)>,
}

impl RunOutcome {
    /// The first declared output's value, if any.
    pub fn output(&self) -> Option<&Value> {
        self.outputs.first().and_then(|(_, v)| v.as_ref())
    }

    /// Result of a named output step.
    pub fn output_of(&self, step_name: &str) -> Option<&Value> {
        self.outputs
            .iter()
            .find(|(name, _)| name == step_name)
            .and_then(|(_, v)| v.as_ref())
    }
}

/// Common interface of the in-process engines.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn execute(
        &self,
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
    ) -> WorkflowResult<RunOutcome>;
}

/// Shared setup: an in-memory broker with one registered worker.
pub(crate) struct InProcessRun {
    pub broker: Arc<Broker<MemoryRuntimeStore>>,
    pub worker_id: String,
    pub instance_id: String,
}

impl InProcessRun {
    pub async fn start(
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
        ctx: &RuntimeContext,
    ) -> WorkflowResult<Self> {
        let broker = Arc::new(Broker::in_memory(ctx.clone()));
        let worker_id = broker
            .register_worker(vec![workflow.schema().clone()])
            .await?;
        let instance_id = broker.dispatch(workflow, inputs).await?;
        for policy in workflow.policies() {
            policy.on_workflow_start(workflow.workflow_id(), &instance_id);
        }
        Ok(Self {
            broker,
            worker_id,
            instance_id,
        })
    }

    /// Collect the final status and output values once the queue drains.
    pub async fn finish(self, workflow: &Workflow) -> WorkflowResult<RunOutcome> {
        let workflow_id = workflow.workflow_id();
        let record = self
            .broker
            .store()
            .run_record(workflow_id, &self.instance_id)
            .await?
            .ok_or_else(|| WorkflowError::UnknownInstance(self.instance_id.clone()))?;
        for policy in workflow.policies() {
            policy.on_workflow_end(workflow_id, &self.instance_id, record.status);
        }
        let mut outputs = Vec::with_capacity(workflow.schema().outputs.len());
        for name in &workflow.schema().outputs {
            let value = self
                .broker
                .store()
                .get_result(workflow_id, &self.instance_id, name)
                .await?;
            outputs.push((name.clone(), value));
        }
        Ok(RunOutcome {
            instance_id: self.instance_id,
            status: record.status,
            outputs,
        })
    }
}

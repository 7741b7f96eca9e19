use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::WorkflowResult;
use crate::runtime::RuntimeContext;
use crate::worker::execute_assignment;
use crate::workflow::Workflow;

use super::{ExecutionEngine, InProcessRun, RunOutcome};

/// Drives a graph one step at a time; the default `run()` engine.
#[derive(Default)]
pub struct SerialEngine {
    ctx: RuntimeContext,
}

impl SerialEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(ctx: RuntimeContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ExecutionEngine for SerialEngine {
    async fn execute(
        &self,
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
    ) -> WorkflowResult<RunOutcome> {
        let run = InProcessRun::start(workflow, inputs, &self.ctx).await?;
        while let Some(assignment) = run.broker.get_step(&run.worker_id).await? {
            let report = execute_assignment(workflow, &assignment, &self.ctx).await;
            run.broker.report_step(&run.worker_id, report).await?;
        }
        run.finish(workflow).await
    }
}

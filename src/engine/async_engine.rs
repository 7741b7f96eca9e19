use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;

use crate::error::WorkflowResult;
use crate::runtime::RuntimeContext;
use crate::worker::execute_assignment;
use crate::workflow::Workflow;

use super::{ExecutionEngine, InProcessRun, RunOutcome};

/// Cooperative single-task engine: every ready step's future is polled
/// concurrently, bounded only by readiness unless a cap is configured.
#[derive(Default)]
pub struct AsyncEngine {
    max_in_flight: Option<usize>,
    ctx: RuntimeContext,
}

impl AsyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the number of overlapping step futures.
    pub fn with_cap(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: Some(max_in_flight.max(1)),
            ctx: RuntimeContext::default(),
        }
    }

    pub fn with_context(ctx: RuntimeContext) -> Self {
        Self {
            max_in_flight: None,
            ctx,
        }
    }
}

#[async_trait]
impl ExecutionEngine for AsyncEngine {
    async fn execute(
        &self,
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
    ) -> WorkflowResult<RunOutcome> {
        let run = InProcessRun::start(workflow, inputs, &self.ctx).await?;
        let mut in_flight = FuturesUnordered::new();
        loop {
            while self.max_in_flight.map_or(true, |cap| in_flight.len() < cap) {
                let Some(assignment) = run.broker.get_step(&run.worker_id).await? else {
                    break;
                };
                let workflow = workflow.clone();
                let ctx = self.ctx.clone();
                in_flight.push(async move { execute_assignment(&workflow, &assignment, &ctx).await });
            }
            let Some(report) = in_flight.next().await else {
                break;
            };
            run.broker.report_step(&run.worker_id, report).await?;
        }
        run.finish(workflow).await
    }
}

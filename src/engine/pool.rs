use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinSet;

use crate::error::{StepError, WorkflowResult};
use crate::runtime::RuntimeContext;
use crate::worker::execute_assignment;
use crate::workflow::Workflow;

use super::{ExecutionEngine, InProcessRun, RunOutcome};

/// Runs independent ready steps on up to `workers` tokio tasks.
pub struct PoolEngine {
    workers: usize,
    ctx: RuntimeContext,
}

impl PoolEngine {
    pub fn new(workers: usize) -> Self {
        Self::with_context(workers, RuntimeContext::default())
    }

    pub fn with_context(workers: usize, ctx: RuntimeContext) -> Self {
        Self {
            workers: workers.max(1),
            ctx,
        }
    }
}

#[async_trait]
impl ExecutionEngine for PoolEngine {
    async fn execute(
        &self,
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
    ) -> WorkflowResult<RunOutcome> {
        let run = InProcessRun::start(workflow, inputs, &self.ctx).await?;
        let mut in_flight = JoinSet::new();
        loop {
            while in_flight.len() < self.workers {
                let Some(assignment) = run.broker.get_step(&run.worker_id).await? else {
                    break;
                };
                let workflow = workflow.clone();
                let ctx = self.ctx.clone();
                in_flight
                    .spawn(async move { execute_assignment(&workflow, &assignment, &ctx).await });
            }
            let Some(joined) = in_flight.join_next().await else {
                // Nothing in flight and no leasable work: the run is drained.
                break;
            };
            let report = joined.map_err(|err| StepError::failed(err))?;
            run.broker.report_step(&run.worker_id, report).await?;
        }
        run.finish(workflow).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;
    use crate::workflow::{FnStep, StepDef};
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn sleeper(millis: u64) -> FnStep {
        FnStep::new(move |_| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(json!(millis))
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_independent_branches_overlap() {
        let wf = Workflow::builder("wf", "1")
            .add_step(StepDef::new("left", sleeper(100)))
            .add_step(StepDef::new("right", sleeper(100)))
            .add_step(
                StepDef::new("join", FnStep::from_sync(|_| Ok(json!("joined"))))
                    .depends_on("l", "left")
                    .depends_on("r", "right"),
            )
            .output("join")
            .build()
            .unwrap();
        let started = Instant::now();
        let outcome = PoolEngine::new(2).execute(&wf, HashMap::new()).await.unwrap();
        let elapsed = started.elapsed();
        assert_eq!(outcome.status, Status::Succeeded);
        assert_eq!(outcome.output(), Some(&json!("joined")));
        // Both branches sleep 100ms; they must not have run back to back.
        assert!(elapsed < Duration::from_millis(190), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_pool_of_one_still_completes() {
        let wf = Workflow::builder("wf", "1")
            .add_step(StepDef::new("a", sleeper(1)))
            .add_step(StepDef::new("b", sleeper(1)))
            .build()
            .unwrap();
        let outcome = PoolEngine::new(1).execute(&wf, HashMap::new()).await.unwrap();
        assert_eq!(outcome.status, Status::Succeeded);
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::broker::{Assignment, BrokerApi, StepReport};
use crate::error::{WorkflowError, WorkflowResult};
use crate::policy::execute_with_policies;
use crate::runtime::RuntimeContext;
use crate::schema::Binding;
use crate::trace::{TraceEvent, TraceEventKind};
use crate::workflow::{StepContext, Workflow};

use super::config::WorkerConfig;

/// Execute one assignment against its runtime workflow and translate the
/// outcome into a [`StepReport`].
///
/// Shared by [`WorkerEngine`] and the in-process engines so both apply
/// identical binding resolution and policy semantics.
pub async fn execute_assignment(
    workflow: &Workflow,
    assignment: &Assignment,
    ctx: &RuntimeContext,
) -> StepReport {
    let step_name = &assignment.step_name;
    let Some(handler) = workflow.handler(step_name) else {
        warn!(step = %step_name, "no handler for assigned step");
        return StepReport::failed(assignment);
    };

    // Resolve the declared bindings into call arguments.
    let mut args = HashMap::new();
    if let Some(step) = workflow.schema().steps.get(step_name) {
        for (param, binding) in &step.bindings {
            let value = match binding {
                Binding::WorkflowInput { key } => assignment.payload.workflow_inputs.get(key),
                Binding::StepOutput { step } => assignment.payload.results.get(step),
                Binding::ConditionalStepOutput { step, condition } => {
                    let value = assignment.payload.results.get(step);
                    if let (Some(value), Some(gate)) = (value, workflow.condition(condition)) {
                        if !gate(value) {
                            return StepReport::skipped(assignment);
                        }
                    }
                    value
                }
            };
            match value {
                Some(value) => {
                    args.insert(param.clone(), value.clone());
                }
                None => {
                    warn!(step = %step_name, param = %param, "payload missing bound parameter");
                    return StepReport::failed(assignment);
                }
            }
        }
    }

    let step_ctx = StepContext {
        step_name: step_name.clone(),
        args,
        workflow_inputs: assignment.payload.workflow_inputs.clone(),
        results: assignment.payload.results.clone(),
    };

    for policy in workflow.policies() {
        policy.on_step_start(&assignment.workflow_id, &assignment.instance_id, step_name);
    }

    let policies = workflow.step_policies(step_name);
    let make_attempt = {
        let handler = handler.clone();
        let template = step_ctx.clone();
        move || -> crate::policy::StepAttempt {
            let handler = handler.clone();
            let ctx = template.clone();
            Box::pin(async move { handler.run(ctx).await })
        }
    };
    let on_retry = |_attempt: u32| {
        if let Some(tracer) = &ctx.tracer {
            tracer.record(TraceEvent::new(
                ctx.now_millis(),
                assignment.workflow_id.clone(),
                assignment.instance_id.clone(),
                Some(step_name.clone()),
                TraceEventKind::Retry,
            ));
        }
    };

    match execute_with_policies(step_name, policies, make_attempt, on_retry).await {
        Ok(result) => {
            for policy in workflow.policies() {
                policy.on_step_success(
                    &assignment.workflow_id,
                    &assignment.instance_id,
                    step_name,
                    &result,
                );
            }
            StepReport::succeeded(assignment, result)
        }
        Err(err) => {
            for policy in workflow.policies() {
                policy.on_step_failure(
                    &assignment.workflow_id,
                    &assignment.instance_id,
                    step_name,
                    &err,
                );
            }
            if err.is_skip() {
                StepReport::skipped(assignment)
            } else {
                debug!(step = %step_name, error = %err, "step failed");
                StepReport::failed(assignment)
            }
        }
    }
}

/// The worker main loop.
pub struct WorkerEngine<B: BrokerApi> {
    broker: Arc<B>,
    workflows: HashMap<(String, String), Workflow>,
    worker_id: String,
    config: WorkerConfig,
    ctx: RuntimeContext,
    shutdown: AtomicBool,
}

impl<B: BrokerApi> WorkerEngine<B> {
    /// Register with the broker and return a connected engine. Registration
    /// failure (e.g. a schema conflict) is fatal for the worker.
    pub async fn connect(
        broker: Arc<B>,
        workflows: Vec<Workflow>,
        config: WorkerConfig,
        ctx: RuntimeContext,
    ) -> WorkflowResult<Self> {
        let schemas = workflows.iter().map(|w| w.schema().clone()).collect();
        let worker_id = broker.register_worker(schemas).await?;
        let workflows = workflows
            .into_iter()
            .map(|w| ((w.workflow_id().to_string(), w.version().to_string()), w))
            .collect();
        Ok(Self {
            broker,
            workflows,
            worker_id,
            config,
            ctx,
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Ask a running [`WorkerEngine::run`] loop to stop after the current
    /// assignment.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Process assignments until the broker has none left. Returns how many
    /// were processed.
    pub async fn run_until_idle(&self) -> WorkflowResult<u64> {
        let mut processed = 0;
        while let Some(assignment) = self.broker.get_step(&self.worker_id).await? {
            self.process(assignment).await?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Poll until [`WorkerEngine::shutdown`]: sleep on empty polls and send
    /// keep-alives on the configured interval.
    pub async fn run(&self) -> WorkflowResult<()> {
        let keep_alive_ms = (self.config.keep_alive_interval_secs * 1_000.0) as i64;
        let mut last_keep_alive = self.ctx.now_millis();
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.broker.get_step(&self.worker_id).await {
                Ok(Some(assignment)) => {
                    self.process(assignment).await?;
                }
                Ok(None) => {
                    tokio::time::sleep(Duration::from_secs_f64(self.config.poll_interval_secs))
                        .await;
                }
                Err(err) => {
                    // Transient transport failures: back off and retry.
                    warn!(error = %err, "get_step failed");
                    tokio::time::sleep(Duration::from_secs_f64(self.config.poll_interval_secs))
                        .await;
                }
            }
            let now = self.ctx.now_millis();
            if now - last_keep_alive >= keep_alive_ms {
                if let Err(err) = self.broker.keep_alive(&self.worker_id).await {
                    warn!(error = %err, "keep-alive failed");
                }
                last_keep_alive = now;
            }
        }
        Ok(())
    }

    async fn process(&self, assignment: Assignment) -> WorkflowResult<()> {
        let key = (
            assignment.workflow_id.clone(),
            assignment.version.clone(),
        );
        let report = match self.workflows.get(&key) {
            Some(workflow) => execute_assignment(workflow, &assignment, &self.ctx).await,
            None => {
                warn!(workflow_id = %key.0, version = %key.1, "assignment for unknown workflow");
                StepReport::failed(&assignment)
            }
        };
        self.report_with_retry(report).await
    }

    /// Bounded retry with doubling backoff. A lease mismatch means the lease
    /// was reclaimed while we ran; the report is abandoned without error.
    async fn report_with_retry(&self, report: StepReport) -> WorkflowResult<()> {
        let mut attempt = 0;
        loop {
            match self
                .broker
                .report_step(&self.worker_id, report.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(WorkflowError::LeaseMismatch { .. }) => {
                    warn!(step = %report.step_name, "lease lost before report; dropping");
                    return Ok(());
                }
                Err(err) if attempt < self.config.report_retries => {
                    let backoff = self.config.report_backoff_secs * f64::from(1 << attempt.min(16));
                    warn!(error = %err, attempt, "report failed, retrying");
                    tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::WorkflowResult;
use crate::schema::WorkflowSchema;
use crate::workflow::Workflow;

use super::types::{Assignment, StepReport};

/// Worker-facing broker surface.
///
/// [`Broker`](super::Broker) implements it in process; a remote transport
/// (e.g. an HTTP client) implements the same trait over the wire types, so
/// the worker engine never knows which one it talks to.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Register a worker able to execute `schemas`; returns the worker id.
    async fn register_worker(&self, schemas: Vec<WorkflowSchema>) -> WorkflowResult<String>;

    /// Create an instance of `workflow` and queue its initial steps;
    /// returns the instance id.
    async fn dispatch(
        &self,
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
    ) -> WorkflowResult<String>;

    /// Lease the next ready step for `worker_id`, or `None` when no work is
    /// available.
    async fn get_step(&self, worker_id: &str) -> WorkflowResult<Option<Assignment>>;

    /// Apply a step outcome. Terminal re-reports are idempotent.
    async fn report_step(&self, worker_id: &str, report: StepReport) -> WorkflowResult<()>;

    /// Record that `worker_id` is still alive.
    async fn keep_alive(&self, worker_id: &str) -> WorkflowResult<()>;
}

//! Pluggable persistence of per-instance runtime state.
//!
//! A [`RuntimeStore`] owns everything an instance accumulates while it runs:
//! step states, results, inputs, the FIFO of ready steps, lease assignments
//! and the run record. [`MemoryRuntimeStore`] backs tests and the in-process
//! engines; the `sqlite` feature adds a crash-safe backend.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryRuntimeStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRuntimeStore;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;
use crate::status::Status;

/// Lease bookkeeping persisted alongside a `RUNNING` step.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAssignment {
    pub worker_id: String,
    pub deadline_ms: i64,
}

/// Workflow-level record of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    /// `Running` until finalized, then the aggregate terminal state.
    pub status: Status,
    pub started_at_ms: i64,
    pub finished_at_ms: Option<i64>,
}

impl RunRecord {
    pub fn is_finished(&self) -> bool {
        self.finished_at_ms.is_some()
    }
}

/// Storage contract for workflow runtime state.
///
/// `fetch_next` must be atomic across concurrent callers: the same step of
/// the same instance is never returned twice. Mutations for one instance are
/// serialized by the broker; the backend only has to keep individual
/// operations consistent.
#[async_trait]
pub trait RuntimeStore: Send + Sync {
    /// Initialize a run: all steps `PENDING`, queue empty, record created.
    async fn create_run(
        &self,
        workflow_id: &str,
        instance_id: &str,
        steps: &[String],
        started_at_ms: i64,
    ) -> Result<(), StorageError>;

    /// Append a step to the instance FIFO. Deduplicated; refused without
    /// error for steps that are no longer `PENDING`.
    async fn enqueue(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<(), StorageError>;

    /// Pop the head of the FIFO, or `None` when empty.
    async fn fetch_next(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<Option<String>, StorageError>;

    async fn set_state(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        state: Status,
    ) -> Result<(), StorageError>;

    async fn get_state(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<Status>, StorageError>;

    async fn set_inputs(
        &self,
        workflow_id: &str,
        instance_id: &str,
        inputs: &HashMap<String, Value>,
    ) -> Result<(), StorageError>;

    async fn get_inputs(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<HashMap<String, Value>, StorageError>;

    async fn set_result(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        result: &Value,
    ) -> Result<(), StorageError>;

    async fn get_result(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<Value>, StorageError>;

    /// Record that `worker_id` is processing the step until `deadline_ms`.
    async fn assign_step(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        worker_id: &str,
        deadline_ms: i64,
    ) -> Result<(), StorageError>;

    async fn get_assignment(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<StoredAssignment>, StorageError>;

    async fn clear_assignment(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<(), StorageError>;

    /// Write the workflow-level terminal state and `finished_at`.
    async fn finalize_run(
        &self,
        workflow_id: &str,
        instance_id: &str,
        status: Status,
        finished_at_ms: i64,
    ) -> Result<(), StorageError>;

    async fn run_record(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<Option<RunRecord>, StorageError>;
}

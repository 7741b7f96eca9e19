//! Orchestrator-level error type.

use thiserror::Error;

use super::{StepError, StorageError};
use crate::status::Status;

/// Errors raised by graph construction, the broker and the worker engine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    // -- graph construction ------------------------------------------------
    #[error("cycle detected in workflow graph")]
    CycleDetected,
    #[error("duplicate step name: {0}")]
    DuplicateStep(String),
    #[error("step not found: {0}")]
    UnknownStep(String),
    #[error("step '{step}' has no handler registered for class '{class}'")]
    UnknownHandler { step: String, class: String },
    #[error("condition '{0}' is not registered")]
    UnknownCondition(String),
    #[error("step '{from}' reaches '{to}' through more than one action")]
    ConflictingEdge { from: String, to: String },

    // -- schema ------------------------------------------------------------
    #[error("schema parse error: {0}")]
    SchemaParse(String),
    #[error("schema serialize error: {0}")]
    SchemaSerialize(String),
    #[error("conflicting schema for workflow {workflow_id} version {version}")]
    SchemaConflict {
        workflow_id: String,
        version: String,
    },

    // -- dispatch & leasing ------------------------------------------------
    #[error("input validation failed: {0}")]
    InputValidation(String),
    #[error("parameter '{param}' of step '{step}' could not be bound")]
    UnboundParameter { step: String, param: String },
    #[error("worker {worker_id} does not hold the lease for step '{step}'")]
    LeaseMismatch { worker_id: String, step: String },
    #[error("unknown worker: {0}")]
    UnknownWorker(String),
    #[error("unknown workflow {workflow_id} version {version}")]
    UnknownWorkflow {
        workflow_id: String,
        version: String,
    },
    #[error("unknown instance: {0}")]
    UnknownInstance(String),
    #[error("invalid transition for step '{step}': {from:?} -> {to:?}")]
    InvalidTransition {
        step: String,
        from: Status,
        to: Status,
    },

    // -- pass-through ------------------------------------------------------
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Step(#[from] StepError),
}

//! Error types.
//!
//! Errors are split in two layers: [`StepError`] covers a single step
//! execution (body failure, timeout, skip signal), while [`WorkflowError`]
//! covers everything the orchestrator can reject (graph construction,
//! dispatch validation, leases, storage). Storage backends report through
//! [`StorageError`], which surfaces intact.

mod step_error;
mod storage_error;
mod workflow_error;

pub use step_error::StepError;
pub use storage_error::StorageError;
pub use workflow_error::WorkflowError;

/// Result alias used throughout the crate.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

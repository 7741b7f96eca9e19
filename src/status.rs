//! Execution status for workflow steps and whole runs.

use serde::{Deserialize, Serialize};

/// State of a step or a workflow instance.
///
/// Transitions are strictly forward: `Pending -> Running -> terminal`.
/// Terminal states are final for a given attempt; the lease reaper may start
/// a fresh attempt by moving an expired `Running` step back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl Status {
    /// Whether this state ends the current attempt.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::Failed | Status::Cancelled | Status::Skipped
        )
    }

    /// Whether this state counts as successful completion for readiness and
    /// for the workflow aggregate (`Succeeded` or `Skipped`).
    pub fn is_successful(self) -> bool {
        matches!(self, Status::Succeeded | Status::Skipped)
    }

    /// Forward-only transition check.
    pub fn can_transition_to(self, next: Status) -> bool {
        match self {
            Status::Pending => next != Status::Pending,
            Status::Running => next.is_terminal(),
            _ => false,
        }
    }

    /// Aggregate a set of step states into the workflow-level terminal state.
    pub fn aggregate<I: IntoIterator<Item = Status>>(steps: I) -> Status {
        if steps.into_iter().all(Status::is_successful) {
            Status::Succeeded
        } else {
            Status::Failed
        }
    }
}

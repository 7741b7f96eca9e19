use std::time::Duration;

use crate::error::StepError;

use super::StepAttempt;

/// Bound a step attempt to a wall-clock duration.
///
/// Cancellation is cooperative: the attempt future is dropped at the
/// deadline and the failure is recorded immediately. The broker also uses
/// this policy's `seconds` to size the assignment lease.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPolicy {
    pub seconds: f64,
}

impl TimeoutPolicy {
    pub fn new(seconds: f64) -> Self {
        Self { seconds }
    }

    pub(super) fn wrap(&self, attempt: StepAttempt) -> StepAttempt {
        let seconds = self.seconds;
        Box::pin(async move {
            match tokio::time::timeout(Duration::from_secs_f64(seconds), attempt).await {
                Ok(result) => result,
                Err(_) => Err(StepError::Timeout { seconds }),
            }
        })
    }
}

//! Step and workflow policies.
//!
//! A step policy wraps one step invocation: it may re-run it, time-bound it
//! or observe failures. Policies compose in list order with the first listed
//! outermost. Retrying is driven by a [`FailureDecision`] protocol so custom
//! policies can also rule on failures. Workflow policies receive lifecycle
//! callbacks and are how tracing hooks into execution.

mod lifecycle;
mod retry;
mod timeout;

pub use lifecycle::{TracePolicy, WorkflowPolicy};
pub use retry::RetryPolicy;
pub use timeout::TimeoutPolicy;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::StepError;
use crate::schema::PolicyConfig;

/// One attempt of the underlying step execution.
pub type StepAttempt = BoxFuture<'static, Result<Value, StepError>>;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailureAction {
    Retry,
    Fail,
}

/// Outcome of [`StepPolicy::on_failure`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailureDecision {
    pub action: FailureAction,
    /// Seconds to sleep before the next attempt.
    pub delay_secs: f64,
}

impl FailureDecision {
    pub fn retry(delay_secs: f64) -> Self {
        Self {
            action: FailureAction::Retry,
            delay_secs,
        }
    }

    pub fn fail() -> Self {
        Self {
            action: FailureAction::Fail,
            delay_secs: 0.0,
        }
    }
}

/// User-defined policy behaviour.
#[async_trait]
pub trait CustomStepPolicy: Send + Sync {
    /// Wrap one attempt. The default runs it unchanged.
    async fn execute(&self, step_name: &str, attempt: StepAttempt) -> Result<Value, StepError> {
        let _ = step_name;
        attempt.await
    }

    /// Rule on a failed attempt. `None` defers to the next policy.
    fn on_failure(
        &self,
        step_name: &str,
        err: &StepError,
        attempt: u32,
    ) -> Option<FailureDecision> {
        let _ = (step_name, err, attempt);
        None
    }
}

/// A policy attached to a step.
#[derive(Clone)]
pub enum StepPolicy {
    Retry(RetryPolicy),
    Timeout(TimeoutPolicy),
    Custom(Arc<dyn CustomStepPolicy>),
}

impl StepPolicy {
    pub fn retry(max_retries: u32, wait_secs: f64) -> Self {
        StepPolicy::Retry(RetryPolicy::new(max_retries, wait_secs))
    }

    pub fn timeout(seconds: f64) -> Self {
        StepPolicy::Timeout(TimeoutPolicy::new(seconds))
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        match config {
            PolicyConfig::Retry {
                max_retries,
                wait_secs,
            } => StepPolicy::retry(*max_retries, *wait_secs),
            PolicyConfig::Timeout { seconds } => StepPolicy::timeout(*seconds),
        }
    }

    /// Serializable form; custom policies have none.
    pub fn to_config(&self) -> Option<PolicyConfig> {
        match self {
            StepPolicy::Retry(p) => Some(PolicyConfig::Retry {
                max_retries: p.max_retries,
                wait_secs: p.wait_secs,
            }),
            StepPolicy::Timeout(p) => Some(PolicyConfig::Timeout { seconds: p.seconds }),
            StepPolicy::Custom(_) => None,
        }
    }

    fn wrap(&self, step_name: &str, attempt: StepAttempt) -> StepAttempt {
        match self {
            StepPolicy::Retry(_) => attempt,
            StepPolicy::Timeout(p) => p.wrap(attempt),
            StepPolicy::Custom(p) => {
                let policy = p.clone();
                let name = step_name.to_string();
                Box::pin(async move { policy.execute(&name, attempt).await })
            }
        }
    }

    fn on_failure(&self, step_name: &str, err: &StepError, attempt: u32) -> Option<FailureDecision> {
        match self {
            StepPolicy::Retry(p) => Some(p.on_failure(attempt)),
            StepPolicy::Timeout(_) => None,
            StepPolicy::Custom(p) => p.on_failure(step_name, err, attempt),
        }
    }
}

impl std::fmt::Debug for StepPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepPolicy::Retry(p) => f.debug_tuple("Retry").field(p).finish(),
            StepPolicy::Timeout(p) => f.debug_tuple("Timeout").field(p).finish(),
            StepPolicy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Run a step call through its policy pipeline.
///
/// `make_attempt` produces a fresh attempt future each time it is invoked;
/// the pipeline re-invokes it when a policy decides to retry. `on_retry` is
/// called with the upcoming attempt number before each re-run.
pub async fn execute_with_policies<F, R>(
    step_name: &str,
    policies: &[StepPolicy],
    mut make_attempt: F,
    mut on_retry: R,
) -> Result<Value, StepError>
where
    F: FnMut() -> StepAttempt + Send,
    R: FnMut(u32) + Send,
{
    let mut attempt: u32 = 0;
    loop {
        let mut fut = make_attempt();
        for policy in policies.iter().rev() {
            fut = policy.wrap(step_name, fut);
        }
        match fut.await {
            Ok(value) => return Ok(value),
            Err(StepError::Skipped) => return Err(StepError::Skipped),
            Err(err) => {
                let decision = policies
                    .iter()
                    .find_map(|p| p.on_failure(step_name, &err, attempt));
                match decision {
                    Some(FailureDecision {
                        action: FailureAction::Retry,
                        delay_secs,
                    }) => {
                        if delay_secs > 0.0 {
                            tokio::time::sleep(Duration::from_secs_f64(delay_secs)).await;
                        }
                        attempt += 1;
                        on_retry(attempt);
                    }
                    _ => return Err(err),
                }
            }
        }
    }
}

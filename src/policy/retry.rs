use super::FailureDecision;

/// Re-run a failed step body a bounded number of times.
///
/// `max_retries` is the total invocation budget: 0 (the default) means run
/// once, 3 means at most three body invocations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub wait_secs: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, wait_secs: f64) -> Self {
        Self {
            max_retries,
            wait_secs,
        }
    }

    pub fn on_failure(&self, attempt: u32) -> FailureDecision {
        if attempt + 1 < self.max_retries {
            FailureDecision::retry(self.wait_secs)
        } else {
            FailureDecision::fail()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::FailureAction;

    #[test]
    fn test_budget_of_three() {
        let p = RetryPolicy::new(3, 0.1);
        assert_eq!(p.on_failure(0).action, FailureAction::Retry);
        assert_eq!(p.on_failure(1).action, FailureAction::Retry);
        assert_eq!(p.on_failure(2).action, FailureAction::Fail);
    }

    #[test]
    fn test_zero_budget_never_retries() {
        let p = RetryPolicy::new(0, 0.0);
        assert_eq!(p.on_failure(0).action, FailureAction::Fail);
    }

    #[test]
    fn test_delay_carried() {
        let p = RetryPolicy::new(2, 1.5);
        assert_eq!(p.on_failure(0).delay_secs, 1.5);
    }
}

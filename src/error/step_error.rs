use thiserror::Error;

/// Errors produced while executing a single step body.
#[derive(Debug, Error)]
pub enum StepError {
    /// The step body failed.
    #[error("step failed: {0}")]
    Failed(String),
    /// The step exceeded its timeout policy.
    #[error("step exceeded {seconds}s")]
    Timeout { seconds: f64 },
    /// The step asked to be skipped instead of running.
    #[error("step skipped")]
    Skipped,
    /// A declared parameter could not be resolved from the payload.
    #[error("missing input for parameter '{param}'")]
    MissingInput { param: String },
}

impl StepError {
    /// Build a [`StepError::Failed`] from any displayable error.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        StepError::Failed(err.to_string())
    }

    /// Whether the worker should report this outcome as `SKIPPED`.
    pub fn is_skip(&self) -> bool {
        matches!(self, StepError::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_display() {
        assert_eq!(
            StepError::Failed("boom".into()).to_string(),
            "step failed: boom"
        );
        assert_eq!(
            StepError::Timeout { seconds: 1.5 }.to_string(),
            "step exceeded 1.5s"
        );
        assert_eq!(StepError::Skipped.to_string(), "step skipped");
        assert_eq!(
            StepError::MissingInput { param: "x".into() }.to_string(),
            "missing input for parameter 'x'"
        );
    }

    #[test]
    fn test_is_skip() {
        assert!(StepError::Skipped.is_skip());
        assert!(!StepError::failed("e").is_skip());
    }
}

use std::sync::Arc;

use serde_json::Value;

use crate::error::StepError;
use crate::runtime::TimeProvider;
use crate::status::Status;
use crate::trace::{TraceEvent, TraceEventKind, Tracer};

/// Lifecycle callbacks around workflow and step execution.
///
/// Hooks are synchronous and must be cheap; anything expensive belongs in a
/// channel behind the hook.
pub trait WorkflowPolicy: Send + Sync {
    fn on_workflow_start(&self, workflow_id: &str, instance_id: &str) {
        let _ = (workflow_id, instance_id);
    }

    fn on_step_start(&self, workflow_id: &str, instance_id: &str, step_name: &str) {
        let _ = (workflow_id, instance_id, step_name);
    }

    fn on_step_success(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        result: &Value,
    ) {
        let _ = (workflow_id, instance_id, step_name, result);
    }

    fn on_step_failure(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        err: &StepError,
    ) {
        let _ = (workflow_id, instance_id, step_name, err);
    }

    fn on_workflow_end(&self, workflow_id: &str, instance_id: &str, status: Status) {
        let _ = (workflow_id, instance_id, status);
    }
}

/// Bridges lifecycle hooks to a [`Tracer`].
pub struct TracePolicy {
    tracer: Arc<dyn Tracer>,
    time: Arc<dyn TimeProvider>,
}

impl TracePolicy {
    pub fn new(tracer: Arc<dyn Tracer>, time: Arc<dyn TimeProvider>) -> Self {
        Self { tracer, time }
    }

    fn emit(&self, workflow_id: &str, instance_id: &str, step: Option<&str>, kind: TraceEventKind) {
        self.tracer.record(TraceEvent::new(
            self.time.now_millis(),
            workflow_id,
            instance_id,
            step.map(str::to_string),
            kind,
        ));
    }
}

impl WorkflowPolicy for TracePolicy {
    fn on_workflow_start(&self, workflow_id: &str, instance_id: &str) {
        self.emit(workflow_id, instance_id, None, TraceEventKind::Start);
    }

    fn on_step_start(&self, workflow_id: &str, instance_id: &str, step_name: &str) {
        self.emit(workflow_id, instance_id, Some(step_name), TraceEventKind::Start);
    }

    fn on_step_success(&self, workflow_id: &str, instance_id: &str, step_name: &str, _: &Value) {
        self.emit(
            workflow_id,
            instance_id,
            Some(step_name),
            TraceEventKind::Success,
        );
    }

    fn on_step_failure(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        err: &StepError,
    ) {
        let kind = if err.is_skip() {
            TraceEventKind::Skip
        } else {
            TraceEventKind::Failure
        };
        self.emit(workflow_id, instance_id, Some(step_name), kind);
    }

    fn on_workflow_end(&self, workflow_id: &str, instance_id: &str, status: Status) {
        let kind = if status == Status::Succeeded {
            TraceEventKind::Success
        } else {
            TraceEventKind::Failure
        };
        self.emit(workflow_id, instance_id, None, kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeTimeProvider;
    use crate::trace::MemoryTracer;

    #[test]
    fn test_trace_policy_records_lifecycle() {
        let tracer = Arc::new(MemoryTracer::new());
        let policy = TracePolicy::new(tracer.clone(), Arc::new(FakeTimeProvider::new(42)));

        policy.on_workflow_start("wf", "i1");
        policy.on_step_start("wf", "i1", "a");
        policy.on_step_success("wf", "i1", "a", &Value::Null);
        policy.on_step_failure("wf", "i1", "b", &StepError::Skipped);
        policy.on_step_failure("wf", "i1", "c", &StepError::failed("boom"));
        policy.on_workflow_end("wf", "i1", Status::Failed);

        let kinds: Vec<_> = tracer.events().iter().map(|e| e.event).collect();
        assert_eq!(
            kinds,
            vec![
                TraceEventKind::Start,
                TraceEventKind::Start,
                TraceEventKind::Success,
                TraceEventKind::Skip,
                TraceEventKind::Failure,
                TraceEventKind::Failure,
            ]
        );
        assert_eq!(tracer.events()[0].timestamp_ms, 42);
        assert_eq!(tracer.events()[0].step_name, None);
    }
}

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::Status;

/// Inputs shipped with an [`Assignment`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentPayload {
    /// The workflow inputs of this instance.
    #[serde(default)]
    pub workflow_inputs: HashMap<String, Value>,
    /// Results of finished predecessors, by step name.
    #[serde(default)]
    pub results: HashMap<String, Value>,
}

/// A leased work item handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub workflow_id: String,
    pub version: String,
    pub instance_id: String,
    pub step_name: String,
    pub payload: AssignmentPayload,
    pub issued_at_ms: i64,
    pub deadline_ms: i64,
    pub worker_id: String,
}

/// Outcome of a step execution sent back to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub workflow_id: String,
    pub instance_id: String,
    pub step_name: String,
    pub state: Status,
    #[serde(default)]
    pub result: Option<Value>,
}

impl StepReport {
    fn new(assignment: &Assignment, state: Status, result: Option<Value>) -> Self {
        Self {
            workflow_id: assignment.workflow_id.clone(),
            instance_id: assignment.instance_id.clone(),
            step_name: assignment.step_name.clone(),
            state,
            result,
        }
    }

    pub fn succeeded(assignment: &Assignment, result: Value) -> Self {
        Self::new(assignment, Status::Succeeded, Some(result))
    }

    pub fn failed(assignment: &Assignment) -> Self {
        Self::new(assignment, Status::Failed, None)
    }

    pub fn skipped(assignment: &Assignment) -> Self {
        Self::new(assignment, Status::Skipped, None)
    }
}

/// Most recent step processed by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastTask {
    pub workflow_id: String,
    pub instance_id: String,
    pub step_name: String,
    pub success: bool,
}

/// Worker metadata returned by [`Broker::list_workers`](super::Broker::list_workers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub connected_at_ms: i64,
    pub last_seen_ms: i64,
    #[serde(default)]
    pub last_task: Option<LastTask>,
}

/// Identity of a registered schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInfo {
    pub workflow_id: String,
    pub version: String,
}

/// Metadata for a workflow repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub workflows: Vec<String>,
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

/// Health payload: `{"status":"ok"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerStatus {
    pub status: String,
}

impl Default for BrokerStatus {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assignment() -> Assignment {
        Assignment {
            workflow_id: "wf".into(),
            version: "1".into(),
            instance_id: "i1".into(),
            step_name: "s".into(),
            payload: AssignmentPayload::default(),
            issued_at_ms: 0,
            deadline_ms: 60_000,
            worker_id: "w1".into(),
        }
    }

    #[test]
    fn test_report_constructors() {
        let a = assignment();
        let ok = StepReport::succeeded(&a, json!(5));
        assert_eq!(ok.state, Status::Succeeded);
        assert_eq!(ok.result, Some(json!(5)));
        assert_eq!(StepReport::failed(&a).state, Status::Failed);
        assert_eq!(StepReport::skipped(&a).result, None);
    }

    #[test]
    fn test_assignment_roundtrips_json() {
        let a = assignment();
        let text = serde_json::to_string(&a).unwrap();
        let back: Assignment = serde_json::from_str(&text).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn test_status_payload() {
        assert_eq!(
            serde_json::to_value(BrokerStatus::default()).unwrap(),
            json!({"status": "ok"})
        );
    }
}

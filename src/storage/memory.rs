//! In-memory storage used by tests and the in-process engines.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::StorageError;
use crate::status::Status;

use super::{RunRecord, RuntimeStore, StoredAssignment};

type RunKey = (String, String);
type StepKey = (String, String, String);

#[derive(Default)]
struct Inner {
    queues: HashMap<RunKey, VecDeque<String>>,
    queued: HashMap<RunKey, HashSet<String>>,
    states: HashMap<StepKey, Status>,
    results: HashMap<StepKey, Value>,
    inputs: HashMap<RunKey, HashMap<String, Value>>,
    assignments: HashMap<StepKey, StoredAssignment>,
    runs: HashMap<RunKey, RunRecord>,
}

/// [`RuntimeStore`] kept entirely in process memory.
#[derive(Default)]
pub struct MemoryRuntimeStore {
    inner: Mutex<Inner>,
}

impl MemoryRuntimeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn run_key(workflow_id: &str, instance_id: &str) -> RunKey {
    (workflow_id.to_string(), instance_id.to_string())
}

fn step_key(workflow_id: &str, instance_id: &str, step_name: &str) -> StepKey {
    (
        workflow_id.to_string(),
        instance_id.to_string(),
        step_name.to_string(),
    )
}

#[async_trait]
impl RuntimeStore for MemoryRuntimeStore {
    async fn create_run(
        &self,
        workflow_id: &str,
        instance_id: &str,
        steps: &[String],
        started_at_ms: i64,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let key = run_key(workflow_id, instance_id);
        for step in steps {
            inner
                .states
                .insert(step_key(workflow_id, instance_id, step), Status::Pending);
        }
        inner.queues.insert(key.clone(), VecDeque::new());
        inner.queued.insert(key.clone(), HashSet::new());
        inner.assignments.retain(|k, _| (k.0.as_str(), k.1.as_str()) != (workflow_id, instance_id));
        inner.results.retain(|k, _| (k.0.as_str(), k.1.as_str()) != (workflow_id, instance_id));
        inner.inputs.remove(&key);
        inner.runs.insert(
            key,
            RunRecord {
                status: Status::Running,
                started_at_ms,
                finished_at_ms: None,
            },
        );
        Ok(())
    }

    async fn enqueue(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        match inner
            .states
            .get(&step_key(workflow_id, instance_id, step_name))
        {
            Some(Status::Pending) => {}
            _ => return Ok(()),
        }
        let key = run_key(workflow_id, instance_id);
        let queued = inner.queued.entry(key.clone()).or_default();
        if !queued.insert(step_name.to_string()) {
            return Ok(());
        }
        inner
            .queues
            .entry(key)
            .or_default()
            .push_back(step_name.to_string());
        Ok(())
    }

    async fn fetch_next(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<Option<String>, StorageError> {
        let mut inner = self.inner.lock();
        let key = run_key(workflow_id, instance_id);
        let step = inner.queues.get_mut(&key).and_then(VecDeque::pop_front);
        if let Some(ref step) = step {
            if let Some(queued) = inner.queued.get_mut(&key) {
                queued.remove(step);
            }
        }
        Ok(step)
    }

    async fn set_state(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        state: Status,
    ) -> Result<(), StorageError> {
        self.inner
            .lock()
            .states
            .insert(step_key(workflow_id, instance_id, step_name), state);
        Ok(())
    }

    async fn get_state(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<Status>, StorageError> {
        Ok(self
            .inner
            .lock()
            .states
            .get(&step_key(workflow_id, instance_id, step_name))
            .copied())
    }

    async fn set_inputs(
        &self,
        workflow_id: &str,
        instance_id: &str,
        inputs: &HashMap<String, Value>,
    ) -> Result<(), StorageError> {
        self.inner
            .lock()
            .inputs
            .insert(run_key(workflow_id, instance_id), inputs.clone());
        Ok(())
    }

    async fn get_inputs(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<HashMap<String, Value>, StorageError> {
        Ok(self
            .inner
            .lock()
            .inputs
            .get(&run_key(workflow_id, instance_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_result(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        result: &Value,
    ) -> Result<(), StorageError> {
        self.inner.lock().results.insert(
            step_key(workflow_id, instance_id, step_name),
            result.clone(),
        );
        Ok(())
    }

    async fn get_result(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<Value>, StorageError> {
        Ok(self
            .inner
            .lock()
            .results
            .get(&step_key(workflow_id, instance_id, step_name))
            .cloned())
    }

    async fn assign_step(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
        worker_id: &str,
        deadline_ms: i64,
    ) -> Result<(), StorageError> {
        self.inner.lock().assignments.insert(
            step_key(workflow_id, instance_id, step_name),
            StoredAssignment {
                worker_id: worker_id.to_string(),
                deadline_ms,
            },
        );
        Ok(())
    }

    async fn get_assignment(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<Option<StoredAssignment>, StorageError> {
        Ok(self
            .inner
            .lock()
            .assignments
            .get(&step_key(workflow_id, instance_id, step_name))
            .cloned())
    }

    async fn clear_assignment(
        &self,
        workflow_id: &str,
        instance_id: &str,
        step_name: &str,
    ) -> Result<(), StorageError> {
        self.inner
            .lock()
            .assignments
            .remove(&step_key(workflow_id, instance_id, step_name));
        Ok(())
    }

    async fn finalize_run(
        &self,
        workflow_id: &str,
        instance_id: &str,
        status: Status,
        finished_at_ms: i64,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let key = run_key(workflow_id, instance_id);
        inner.assignments.retain(|k, _| (k.0.as_str(), k.1.as_str()) != (workflow_id, instance_id));
        let record = inner
            .runs
            .get_mut(&key)
            .ok_or_else(|| StorageError::UnknownRun {
                workflow_id: workflow_id.to_string(),
                instance_id: instance_id.to_string(),
            })?;
        record.status = status;
        record.finished_at_ms = Some(finished_at_ms);
        Ok(())
    }

    async fn run_record(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> Result<Option<RunRecord>, StorageError> {
        Ok(self
            .inner
            .lock()
            .runs
            .get(&run_key(workflow_id, instance_id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn steps(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_create_run_resets_state() {
        let store = MemoryRuntimeStore::new();
        store
            .create_run("wf", "i1", &steps(&["a", "b"]), 100)
            .await
            .unwrap();
        assert_eq!(
            store.get_state("wf", "i1", "a").await.unwrap(),
            Some(Status::Pending)
        );
        let record = store.run_record("wf", "i1").await.unwrap().unwrap();
        assert_eq!(record.status, Status::Running);
        assert!(!record.is_finished());
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates() {
        let store = MemoryRuntimeStore::new();
        store.create_run("wf", "i1", &steps(&["a"]), 0).await.unwrap();
        store.enqueue("wf", "i1", "a").await.unwrap();
        store.enqueue("wf", "i1", "a").await.unwrap();
        assert_eq!(store.fetch_next("wf", "i1").await.unwrap(), Some("a".into()));
        assert_eq!(store.fetch_next("wf", "i1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_enqueue_refused_for_running_step() {
        let store = MemoryRuntimeStore::new();
        store.create_run("wf", "i1", &steps(&["a"]), 0).await.unwrap();
        store
            .set_state("wf", "i1", "a", Status::Running)
            .await
            .unwrap();
        store.enqueue("wf", "i1", "a").await.unwrap();
        assert_eq!(store.fetch_next("wf", "i1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let store = MemoryRuntimeStore::new();
        store
            .create_run("wf", "i1", &steps(&["a", "b", "c"]), 0)
            .await
            .unwrap();
        for step in ["a", "b", "c"] {
            store.enqueue("wf", "i1", step).await.unwrap();
        }
        assert_eq!(store.fetch_next("wf", "i1").await.unwrap(), Some("a".into()));
        assert_eq!(store.fetch_next("wf", "i1").await.unwrap(), Some("b".into()));
        assert_eq!(store.fetch_next("wf", "i1").await.unwrap(), Some("c".into()));
    }

    #[tokio::test]
    async fn test_results_and_inputs() {
        let store = MemoryRuntimeStore::new();
        store.create_run("wf", "i1", &steps(&["a"]), 0).await.unwrap();
        store
            .set_inputs("wf", "i1", &[("x".to_string(), json!(1))].into_iter().collect())
            .await
            .unwrap();
        store
            .set_result("wf", "i1", "a", &json!({"out": 2}))
            .await
            .unwrap();
        assert_eq!(store.get_inputs("wf", "i1").await.unwrap()["x"], json!(1));
        assert_eq!(
            store.get_result("wf", "i1", "a").await.unwrap(),
            Some(json!({"out": 2}))
        );
        assert_eq!(store.get_result("wf", "i1", "b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_finalize_clears_assignments() {
        let store = MemoryRuntimeStore::new();
        store.create_run("wf", "i1", &steps(&["a"]), 0).await.unwrap();
        store
            .assign_step("wf", "i1", "a", "w1", 500)
            .await
            .unwrap();
        assert!(store.get_assignment("wf", "i1", "a").await.unwrap().is_some());
        store
            .finalize_run("wf", "i1", Status::Succeeded, 900)
            .await
            .unwrap();
        assert!(store.get_assignment("wf", "i1", "a").await.unwrap().is_none());
        let record = store.run_record("wf", "i1").await.unwrap().unwrap();
        assert_eq!(record.status, Status::Succeeded);
        assert_eq!(record.finished_at_ms, Some(900));
    }

    #[tokio::test]
    async fn test_finalize_unknown_run_errors() {
        let store = MemoryRuntimeStore::new();
        assert!(store
            .finalize_run("wf", "ghost", Status::Failed, 0)
            .await
            .is_err());
    }
}

//! Broker scheduler: registration, dispatch, leasing, report processing and
//! lease reaping.
//!
//! The broker owns the authoritative view of every instance. All state
//! mutation flows through the [`RuntimeStore`]; workers only propose
//! transitions via [`StepReport`]s. Mutations for one instance are
//! serialized behind a per-instance async mutex, so readiness recomputation
//! is atomic; operations on different instances proceed in parallel.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{WorkflowError, WorkflowResult};
use crate::graph::build_graph;
use crate::runtime::RuntimeContext;
use crate::schema::{Binding, JoinMode, WorkflowSchema, DEFAULT_ACTION};
use crate::status::Status;
use crate::storage::RuntimeStore;
use crate::trace::TraceEventKind;
use crate::workflow::Workflow;

use super::api::BrokerApi;
use super::config::BrokerConfig;
use super::types::{
    Assignment, AssignmentPayload, BrokerStatus, LastTask, RepositoryInfo, StepReport,
    WorkerInfo, WorkflowInfo,
};

type SchemaKey = (String, String);
type RunKey = (String, String);
type LeaseKey = (String, String, String);

struct WorkerEntry {
    connected_at_ms: i64,
    last_seen_ms: i64,
    schemas: HashSet<SchemaKey>,
    last_task: Option<LastTask>,
}

#[derive(Debug, Clone)]
struct Lease {
    worker_id: String,
    deadline_ms: i64,
}

#[derive(Debug, Clone)]
struct InstanceRef {
    workflow_id: String,
    version: String,
    instance_id: String,
}

/// Outcome of assembling a payload at lease time.
enum LeaseDecision {
    Lease(AssignmentPayload),
    Fail { param: String },
    Skip,
}

/// Readiness verdict for one successor.
enum Readiness {
    Ready,
    Cancel,
    Wait,
}

/// The central coordinator. Generic over the runtime storage backend.
pub struct Broker<S: RuntimeStore> {
    store: Arc<S>,
    ctx: RuntimeContext,
    config: BrokerConfig,
    schemas: DashMap<SchemaKey, WorkflowSchema>,
    runtimes: DashMap<SchemaKey, Workflow>,
    workers: DashMap<String, WorkerEntry>,
    instances: Mutex<Vec<InstanceRef>>,
    instance_versions: DashMap<RunKey, String>,
    instance_locks: DashMap<RunKey, Arc<tokio::sync::Mutex<()>>>,
    leases: DashMap<LeaseKey, Lease>,
    reclaims: DashMap<LeaseKey, u32>,
    repositories: Mutex<BTreeMap<String, RepositoryInfo>>,
}

impl<S: RuntimeStore> Broker<S> {
    pub fn new(store: S, config: BrokerConfig, ctx: RuntimeContext) -> Self {
        Self {
            store: Arc::new(store),
            ctx,
            config,
            schemas: DashMap::new(),
            runtimes: DashMap::new(),
            workers: DashMap::new(),
            instances: Mutex::new(Vec::new()),
            instance_versions: DashMap::new(),
            instance_locks: DashMap::new(),
            leases: DashMap::new(),
            reclaims: DashMap::new(),
            repositories: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Health payload for the `/status` surface.
    pub fn status(&self) -> BrokerStatus {
        BrokerStatus::default()
    }

    // -- registration ------------------------------------------------------

    /// Register a worker able to execute `schemas`. A definition differing
    /// from an already registered `(workflow_id, version)` is rejected and
    /// the worker is not registered.
    pub async fn register_worker(&self, schemas: Vec<WorkflowSchema>) -> WorkflowResult<String> {
        let mut keys = HashSet::new();
        for schema in schemas {
            keys.insert(self.register_schema(schema)?);
        }
        let worker_id = self.ctx.id_generator.next_id();
        let now = self.ctx.now_millis();
        self.workers.insert(
            worker_id.clone(),
            WorkerEntry {
                connected_at_ms: now,
                last_seen_ms: now,
                schemas: keys,
                last_task: None,
            },
        );
        info!(worker_id = %worker_id, "worker registered");
        Ok(worker_id)
    }

    /// Register a runtime workflow without attaching a worker. Dispatch does
    /// this implicitly.
    pub fn register_workflow(&self, workflow: &Workflow) -> WorkflowResult<()> {
        let key = self.register_schema(workflow.schema().clone())?;
        self.runtimes.insert(key, workflow.clone());
        Ok(())
    }

    fn register_schema(&self, schema: WorkflowSchema) -> WorkflowResult<SchemaKey> {
        let schema = schema.normalized();
        build_graph(&schema)?;
        let key = schema.key();
        if let Some(existing) = self.schemas.get(&key) {
            if *existing != schema {
                return Err(WorkflowError::SchemaConflict {
                    workflow_id: key.0,
                    version: key.1,
                });
            }
        } else {
            self.schemas.insert(key.clone(), schema);
        }
        Ok(key)
    }

    pub async fn keep_alive(&self, worker_id: &str) -> WorkflowResult<()> {
        let mut entry = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| WorkflowError::UnknownWorker(worker_id.to_string()))?;
        entry.last_seen_ms = self.ctx.now_millis();
        Ok(())
    }

    // -- dispatch ----------------------------------------------------------

    /// Create an instance: validate inputs, evaluate condition gates, queue
    /// every root step and return the fresh instance id.
    pub async fn dispatch(
        &self,
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
    ) -> WorkflowResult<String> {
        let schema = workflow.schema();
        validate_inputs(schema, &inputs)?;
        self.register_workflow(workflow)?;

        let instance_id = self.ctx.id_generator.next_id();
        let workflow_id = schema.workflow_id.clone();
        let version = schema.version.clone();
        let run_key = (workflow_id.clone(), instance_id.clone());
        let step_names: Vec<String> = schema.steps.keys().cloned().collect();

        let lock = self.instance_lock(&run_key);
        let _guard = lock.lock().await;

        let now = self.ctx.now_millis();
        self.store
            .create_run(&workflow_id, &instance_id, &step_names, now)
            .await?;
        self.store
            .set_inputs(&workflow_id, &instance_id, &inputs)
            .await?;
        self.instance_versions
            .insert(run_key.clone(), version.clone());
        self.instances.lock().push(InstanceRef {
            workflow_id: workflow_id.clone(),
            version: version.clone(),
            instance_id: instance_id.clone(),
        });
        self.trace(&workflow_id, &instance_id, None, TraceEventKind::Start);

        // Condition gates run before anything can be queued.
        let gate_ctx = Value::Object(
            inputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let mut skipped = Vec::new();
        for name in schema.steps.keys() {
            let gates = workflow.step_gates(name);
            if !gates.is_empty() && gates.iter().any(|gate| !gate(&gate_ctx)) {
                self.store
                    .set_state(&workflow_id, &instance_id, name, Status::Skipped)
                    .await?;
                self.trace(
                    &workflow_id,
                    &instance_id,
                    Some(name),
                    TraceEventKind::Skip,
                );
                skipped.push(name.clone());
            }
        }

        for (name, step) in &schema.steps {
            if step.predecessors.is_empty() {
                self.store.enqueue(&workflow_id, &instance_id, name).await?;
            }
        }
        let schema = schema.clone();
        self.propagate_from(&schema, &instance_id, skipped).await?;
        self.maybe_finalize(&schema, &instance_id).await?;

        debug!(workflow_id = %workflow_id, instance_id = %instance_id, "instance dispatched");
        Ok(instance_id)
    }

    // -- leasing -----------------------------------------------------------

    /// Lease the next ready step this worker can execute.
    pub async fn get_step(&self, worker_id: &str) -> WorkflowResult<Option<Assignment>> {
        let allowed: HashSet<SchemaKey> = {
            let mut entry = self
                .workers
                .get_mut(worker_id)
                .ok_or_else(|| WorkflowError::UnknownWorker(worker_id.to_string()))?;
            entry.last_seen_ms = self.ctx.now_millis();
            entry.schemas.clone()
        };

        let candidates: Vec<InstanceRef> = self.instances.lock().clone();
        for inst in candidates {
            let key = (inst.workflow_id.clone(), inst.version.clone());
            if !allowed.contains(&key) {
                continue;
            }
            let Some(schema) = self.schemas.get(&key).map(|s| s.clone()) else {
                continue;
            };
            let runtime = self.runtimes.get(&key).map(|w| w.clone());

            let run_key = (inst.workflow_id.clone(), inst.instance_id.clone());
            let lock = self.instance_lock(&run_key);
            let _guard = lock.lock().await;

            loop {
                let Some(step_name) = self
                    .store
                    .fetch_next(&inst.workflow_id, &inst.instance_id)
                    .await?
                else {
                    break;
                };
                // Stale queue entries are dropped silently.
                let state = self
                    .store
                    .get_state(&inst.workflow_id, &inst.instance_id, &step_name)
                    .await?;
                if state != Some(Status::Pending) {
                    continue;
                }

                match self
                    .assemble_payload(&schema, runtime.as_ref(), &inst.instance_id, &step_name)
                    .await?
                {
                    LeaseDecision::Lease(payload) => {
                        let now = self.ctx.now_millis();
                        let lease_secs = schema
                            .steps
                            .get(&step_name)
                            .and_then(|s| s.timeout_secs())
                            .map(|secs| (secs * 1_000.0) as i64)
                            .unwrap_or_else(|| self.config.default_lease_ms());
                        let deadline_ms = now + lease_secs;
                        self.store
                            .set_state(
                                &inst.workflow_id,
                                &inst.instance_id,
                                &step_name,
                                Status::Running,
                            )
                            .await?;
                        self.store
                            .assign_step(
                                &inst.workflow_id,
                                &inst.instance_id,
                                &step_name,
                                worker_id,
                                deadline_ms,
                            )
                            .await?;
                        self.leases.insert(
                            (
                                inst.workflow_id.clone(),
                                inst.instance_id.clone(),
                                step_name.clone(),
                            ),
                            Lease {
                                worker_id: worker_id.to_string(),
                                deadline_ms,
                            },
                        );
                        self.trace(
                            &inst.workflow_id,
                            &inst.instance_id,
                            Some(&step_name),
                            TraceEventKind::Start,
                        );
                        return Ok(Some(Assignment {
                            workflow_id: inst.workflow_id.clone(),
                            version: inst.version.clone(),
                            instance_id: inst.instance_id.clone(),
                            step_name,
                            payload,
                            issued_at_ms: now,
                            deadline_ms,
                            worker_id: worker_id.to_string(),
                        }));
                    }
                    LeaseDecision::Fail { param } => {
                        warn!(
                            step = %step_name,
                            param = %param,
                            "unbound parameter, failing step at lease time"
                        );
                        self.store
                            .set_state(
                                &inst.workflow_id,
                                &inst.instance_id,
                                &step_name,
                                Status::Failed,
                            )
                            .await?;
                        self.trace(
                            &inst.workflow_id,
                            &inst.instance_id,
                            Some(&step_name),
                            TraceEventKind::Failure,
                        );
                        self.propagate_from(&schema, &inst.instance_id, vec![step_name])
                            .await?;
                        self.maybe_finalize(&schema, &inst.instance_id).await?;
                    }
                    LeaseDecision::Skip => {
                        self.store
                            .set_state(
                                &inst.workflow_id,
                                &inst.instance_id,
                                &step_name,
                                Status::Skipped,
                            )
                            .await?;
                        self.trace(
                            &inst.workflow_id,
                            &inst.instance_id,
                            Some(&step_name),
                            TraceEventKind::Skip,
                        );
                        self.propagate_from(&schema, &inst.instance_id, vec![step_name])
                            .await?;
                        self.maybe_finalize(&schema, &inst.instance_id).await?;
                    }
                }
            }
        }
        Ok(None)
    }

    /// Resolve a step's bindings into the assignment payload.
    async fn assemble_payload(
        &self,
        schema: &WorkflowSchema,
        runtime: Option<&Workflow>,
        instance_id: &str,
        step_name: &str,
    ) -> WorkflowResult<LeaseDecision> {
        let workflow_id = &schema.workflow_id;
        let step = schema
            .steps
            .get(step_name)
            .ok_or_else(|| WorkflowError::UnknownStep(step_name.to_string()))?;

        let workflow_inputs = self.store.get_inputs(workflow_id, instance_id).await?;
        let mut results = HashMap::new();
        for pred in &step.predecessors {
            if let Some(value) = self.store.get_result(workflow_id, instance_id, pred).await? {
                results.insert(pred.clone(), value);
            }
        }

        for (param, binding) in &step.bindings {
            match binding {
                Binding::WorkflowInput { key } => {
                    if !workflow_inputs.contains_key(key) {
                        return Ok(LeaseDecision::Fail {
                            param: param.clone(),
                        });
                    }
                }
                Binding::StepOutput { step: dep } => {
                    if !results.contains_key(dep) {
                        return Ok(LeaseDecision::Fail {
                            param: param.clone(),
                        });
                    }
                }
                Binding::ConditionalStepOutput {
                    step: dep,
                    condition,
                } => {
                    let Some(value) = results.get(dep) else {
                        return Ok(LeaseDecision::Fail {
                            param: param.clone(),
                        });
                    };
                    if let Some(gate) = runtime.and_then(|w| w.condition(condition)) {
                        if !gate(value) {
                            return Ok(LeaseDecision::Skip);
                        }
                    }
                }
            }
        }

        Ok(LeaseDecision::Lease(AssignmentPayload {
            workflow_inputs,
            results,
        }))
    }

    // -- reporting ---------------------------------------------------------

    /// Apply a worker's report. Terminal re-reports are idempotent;
    /// non-terminal reports are progress visibility only.
    pub async fn report_step(&self, worker_id: &str, report: StepReport) -> WorkflowResult<()> {
        if !self.workers.contains_key(worker_id) {
            return Err(WorkflowError::UnknownWorker(worker_id.to_string()));
        }
        let run_key = (report.workflow_id.clone(), report.instance_id.clone());
        let version = self
            .instance_versions
            .get(&run_key)
            .map(|v| v.clone())
            .ok_or_else(|| WorkflowError::UnknownInstance(report.instance_id.clone()))?;
        let key = (report.workflow_id.clone(), version);
        let schema = self
            .schemas
            .get(&key)
            .map(|s| s.clone())
            .ok_or_else(|| WorkflowError::UnknownWorkflow {
                workflow_id: key.0.clone(),
                version: key.1.clone(),
            })?;
        if !schema.steps.contains_key(&report.step_name) {
            return Err(WorkflowError::UnknownStep(report.step_name.clone()));
        }

        let lock = self.instance_lock(&run_key);
        let _guard = lock.lock().await;

        let current = self
            .store
            .get_state(&report.workflow_id, &report.instance_id, &report.step_name)
            .await?;
        if current.map_or(false, Status::is_terminal) {
            // Late or duplicate terminal report: accepted, no effect.
            debug!(step = %report.step_name, "duplicate terminal report ignored");
            return Ok(());
        }
        if !report.state.is_terminal() {
            self.touch_worker(worker_id, None);
            return Ok(());
        }

        let assignment = self
            .store
            .get_assignment(&report.workflow_id, &report.instance_id, &report.step_name)
            .await?;
        match assignment {
            Some(a) if a.worker_id == worker_id => {}
            _ => {
                return Err(WorkflowError::LeaseMismatch {
                    worker_id: worker_id.to_string(),
                    step: report.step_name.clone(),
                })
            }
        }
        self.store
            .clear_assignment(&report.workflow_id, &report.instance_id, &report.step_name)
            .await?;
        self.leases.remove(&(
            report.workflow_id.clone(),
            report.instance_id.clone(),
            report.step_name.clone(),
        ));

        let kind = match report.state {
            Status::Succeeded => {
                let result = report.result.clone().unwrap_or(Value::Null);
                self.store
                    .set_result(
                        &report.workflow_id,
                        &report.instance_id,
                        &report.step_name,
                        &result,
                    )
                    .await?;
                TraceEventKind::Success
            }
            Status::Skipped => TraceEventKind::Skip,
            Status::Cancelled => TraceEventKind::Cancel,
            _ => TraceEventKind::Failure,
        };
        self.store
            .set_state(
                &report.workflow_id,
                &report.instance_id,
                &report.step_name,
                report.state,
            )
            .await?;
        self.trace(
            &report.workflow_id,
            &report.instance_id,
            Some(&report.step_name),
            kind,
        );
        self.touch_worker(
            worker_id,
            Some(LastTask {
                workflow_id: report.workflow_id.clone(),
                instance_id: report.instance_id.clone(),
                step_name: report.step_name.clone(),
                success: report.state.is_successful(),
            }),
        );

        self.propagate_from(&schema, &report.instance_id, vec![report.step_name.clone()])
            .await?;
        self.maybe_finalize(&schema, &report.instance_id).await?;
        Ok(())
    }

    fn touch_worker(&self, worker_id: &str, last_task: Option<LastTask>) {
        if let Some(mut entry) = self.workers.get_mut(worker_id) {
            entry.last_seen_ms = self.ctx.now_millis();
            if last_task.is_some() {
                entry.last_task = last_task;
            }
        }
    }

    // -- readiness & cancellation -----------------------------------------

    /// Walk successors of freshly terminal steps: enqueue the ready ones and
    /// cancel the unreachable ones, recursively.
    async fn propagate_from(
        &self,
        schema: &WorkflowSchema,
        instance_id: &str,
        seeds: Vec<String>,
    ) -> WorkflowResult<()> {
        let workflow_id = &schema.workflow_id;
        let mut work: VecDeque<String> = seeds.into();
        while let Some(step_name) = work.pop_front() {
            let Some(step) = schema.steps.get(&step_name) else {
                continue;
            };
            let targets: BTreeSet<&str> = step.edges().map(|(_, t)| t).collect();
            for target in targets {
                match self.evaluate_readiness(schema, instance_id, target).await? {
                    Readiness::Ready => {
                        self.store.enqueue(workflow_id, instance_id, target).await?;
                    }
                    Readiness::Cancel => {
                        self.store
                            .set_state(workflow_id, instance_id, target, Status::Cancelled)
                            .await?;
                        self.trace(
                            workflow_id,
                            instance_id,
                            Some(target),
                            TraceEventKind::Cancel,
                        );
                        work.push_back(target.to_string());
                    }
                    Readiness::Wait => {}
                }
            }
        }
        Ok(())
    }

    /// Decide whether `target` is ready, doomed or still waiting.
    async fn evaluate_readiness(
        &self,
        schema: &WorkflowSchema,
        instance_id: &str,
        target: &str,
    ) -> WorkflowResult<Readiness> {
        let workflow_id = &schema.workflow_id;
        let Some(target_schema) = schema.steps.get(target) else {
            return Ok(Readiness::Wait);
        };
        // Readiness is monotone: only PENDING steps are re-evaluated.
        let state = self.store.get_state(workflow_id, instance_id, target).await?;
        if state != Some(Status::Pending) {
            return Ok(Readiness::Wait);
        }
        if target_schema.predecessors.is_empty() {
            return Ok(Readiness::Wait);
        }

        let mut all_terminal = true;
        let mut any_failed = false;
        let mut any_selected = false;
        for pred in &target_schema.predecessors {
            let pred_state = self
                .store
                .get_state(workflow_id, instance_id, pred)
                .await?
                .unwrap_or(Status::Pending);
            if !pred_state.is_terminal() {
                all_terminal = false;
                continue;
            }
            match pred_state {
                Status::Failed | Status::Cancelled => any_failed = true,
                Status::Succeeded | Status::Skipped => {
                    if self
                        .edge_selected(schema, instance_id, pred, target, pred_state)
                        .await?
                    {
                        any_selected = true;
                    }
                }
                _ => {}
            }
        }

        Ok(match target_schema.join_mode {
            JoinMode::And => {
                if any_failed {
                    Readiness::Cancel
                } else if all_terminal {
                    if any_selected {
                        Readiness::Ready
                    } else {
                        Readiness::Cancel
                    }
                } else {
                    Readiness::Wait
                }
            }
            JoinMode::Or => {
                if any_selected {
                    Readiness::Ready
                } else if all_terminal {
                    Readiness::Cancel
                } else {
                    Readiness::Wait
                }
            }
        })
    }

    /// Whether `pred` activated its edge to `target`: the predecessor ended
    /// successfully and its chosen action lists the target. A `SUCCEEDED`
    /// result that is a string matching an action selects that branch;
    /// anything else selects `default`. A `SKIPPED` step selects `default`.
    async fn edge_selected(
        &self,
        schema: &WorkflowSchema,
        instance_id: &str,
        pred: &str,
        target: &str,
        pred_state: Status,
    ) -> WorkflowResult<bool> {
        let Some(pred_schema) = schema.steps.get(pred) else {
            return Ok(false);
        };
        let action = match pred_state {
            Status::Skipped => DEFAULT_ACTION.to_string(),
            Status::Succeeded => {
                let result = self
                    .store
                    .get_result(&schema.workflow_id, instance_id, pred)
                    .await?;
                match result {
                    Some(Value::String(s)) if pred_schema.successors.contains_key(&s) => s,
                    _ => DEFAULT_ACTION.to_string(),
                }
            }
            _ => return Ok(false),
        };
        Ok(pred_schema
            .successors
            .get(&action)
            .map_or(false, |targets| targets.iter().any(|t| t == target)))
    }

    /// Finalize the run the first time every step is terminal.
    async fn maybe_finalize(
        &self,
        schema: &WorkflowSchema,
        instance_id: &str,
    ) -> WorkflowResult<bool> {
        let workflow_id = &schema.workflow_id;
        let record = self.store.run_record(workflow_id, instance_id).await?;
        if record.map_or(true, |r| r.is_finished()) {
            return Ok(false);
        }
        let mut states = Vec::with_capacity(schema.steps.len());
        for name in schema.steps.keys() {
            match self.store.get_state(workflow_id, instance_id, name).await? {
                Some(state) if state.is_terminal() => states.push(state),
                _ => return Ok(false),
            }
        }
        let status = Status::aggregate(states);
        self.store
            .finalize_run(workflow_id, instance_id, status, self.ctx.now_millis())
            .await?;
        let kind = if status == Status::Succeeded {
            TraceEventKind::Success
        } else {
            TraceEventKind::Failure
        };
        self.trace(workflow_id, instance_id, None, kind);
        self.instances
            .lock()
            .retain(|r| !(r.workflow_id == *workflow_id && r.instance_id == instance_id));
        info!(workflow_id = %workflow_id, instance_id = %instance_id, ?status, "run finalized");
        Ok(true)
    }

    // -- cancellation & reaping -------------------------------------------

    /// Caller-initiated cancellation: every non-terminal step becomes
    /// `CANCELLED` and the run finalizes `FAILED`.
    pub async fn cancel_instance(
        &self,
        workflow_id: &str,
        instance_id: &str,
    ) -> WorkflowResult<()> {
        let run_key = (workflow_id.to_string(), instance_id.to_string());
        let version = self
            .instance_versions
            .get(&run_key)
            .map(|v| v.clone())
            .ok_or_else(|| WorkflowError::UnknownInstance(instance_id.to_string()))?;
        let key = (workflow_id.to_string(), version);
        let Some(schema) = self.schemas.get(&key).map(|s| s.clone()) else {
            return Err(WorkflowError::UnknownWorkflow {
                workflow_id: key.0,
                version: key.1,
            });
        };

        let lock = self.instance_lock(&run_key);
        let _guard = lock.lock().await;
        for name in schema.steps.keys() {
            let state = self.store.get_state(workflow_id, instance_id, name).await?;
            if state.map_or(true, |s| s.is_terminal()) {
                continue;
            }
            self.store
                .set_state(workflow_id, instance_id, name, Status::Cancelled)
                .await?;
            self.store
                .clear_assignment(workflow_id, instance_id, name)
                .await?;
            self.leases.remove(&(
                workflow_id.to_string(),
                instance_id.to_string(),
                name.clone(),
            ));
            self.trace(workflow_id, instance_id, Some(name), TraceEventKind::Cancel);
        }
        self.maybe_finalize(&schema, instance_id).await?;
        Ok(())
    }

    /// Reclaim expired leases and prune dead workers. Normally driven by
    /// [`Broker::spawn_reaper`]; exposed for deterministic tests.
    pub async fn reap(&self, now_ms: i64) -> WorkflowResult<()> {
        let expired: Vec<(LeaseKey, Lease)> = self
            .leases
            .iter()
            .filter(|entry| entry.value().deadline_ms < now_ms)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (key, lease) in expired {
            self.reclaim_lease(&key, &lease).await?;
        }

        let timeout = self.config.worker_timeout_ms();
        let dead: Vec<String> = self
            .workers
            .iter()
            .filter(|entry| entry.value().last_seen_ms + timeout < now_ms)
            .map(|entry| entry.key().clone())
            .collect();
        for worker_id in dead {
            self.workers.remove(&worker_id);
            warn!(worker_id = %worker_id, "worker pruned after missed heartbeats");
            let orphaned: Vec<(LeaseKey, Lease)> = self
                .leases
                .iter()
                .filter(|entry| entry.value().worker_id == worker_id)
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect();
            for (key, lease) in orphaned {
                self.reclaim_lease(&key, &lease).await?;
            }
        }
        Ok(())
    }

    async fn reclaim_lease(&self, key: &LeaseKey, expected: &Lease) -> WorkflowResult<()> {
        let (workflow_id, instance_id, step_name) = key;
        let run_key = (workflow_id.clone(), instance_id.clone());
        let lock = self.instance_lock(&run_key);
        let _guard = lock.lock().await;

        // CAS-style check: the lease must still be the one we observed.
        let stored = self
            .store
            .get_assignment(workflow_id, instance_id, step_name)
            .await?;
        let matches = stored.map_or(false, |a| {
            a.worker_id == expected.worker_id && a.deadline_ms == expected.deadline_ms
        });
        if !matches {
            self.leases.remove(key);
            return Ok(());
        }
        let state = self
            .store
            .get_state(workflow_id, instance_id, step_name)
            .await?;
        self.store
            .clear_assignment(workflow_id, instance_id, step_name)
            .await?;
        self.leases.remove(key);
        if state != Some(Status::Running) {
            return Ok(());
        }
        self.store
            .set_state(workflow_id, instance_id, step_name, Status::Pending)
            .await?;
        self.store
            .enqueue(workflow_id, instance_id, step_name)
            .await?;
        *self.reclaims.entry(key.clone()).or_insert(0) += 1;
        self.trace(
            workflow_id,
            instance_id,
            Some(step_name),
            TraceEventKind::Retry,
        );
        warn!(step = %step_name, worker_id = %expected.worker_id, "lease expired, step requeued");
        Ok(())
    }

    /// Times a lease of this step has been reclaimed.
    pub fn reclaim_count(&self, workflow_id: &str, instance_id: &str, step_name: &str) -> u32 {
        self.reclaims
            .get(&(
                workflow_id.to_string(),
                instance_id.to_string(),
                step_name.to_string(),
            ))
            .map(|c| *c)
            .unwrap_or(0)
    }

    // -- inspectors --------------------------------------------------------

    /// Never fails: missing runtime data shows up as `None` fields.
    pub fn list_workers(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self
            .workers
            .iter()
            .map(|entry| WorkerInfo {
                worker_id: entry.key().clone(),
                connected_at_ms: entry.value().connected_at_ms,
                last_seen_ms: entry.value().last_seen_ms,
                last_task: entry.value().last_task.clone(),
            })
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    pub fn list_workflows(&self) -> Vec<WorkflowInfo> {
        let mut infos: Vec<WorkflowInfo> = self
            .schemas
            .iter()
            .map(|entry| WorkflowInfo {
                workflow_id: entry.key().0.clone(),
                version: entry.key().1.clone(),
            })
            .collect();
        infos.sort_by(|a, b| {
            (a.workflow_id.as_str(), a.version.as_str())
                .cmp(&(b.workflow_id.as_str(), b.version.as_str()))
        });
        infos
    }

    pub fn register_repository(&self, repo: RepositoryInfo) {
        self.repositories.lock().insert(repo.name.clone(), repo);
    }

    pub fn get_repository(&self, name: &str) -> Option<RepositoryInfo> {
        self.repositories.lock().get(name).cloned()
    }

    /// Page through registered repositories; `page` is 1-based.
    pub fn list_repositories(&self, page: usize, page_size: usize) -> Vec<RepositoryInfo> {
        self.repositories
            .lock()
            .values()
            .skip(page.saturating_sub(1) * page_size)
            .take(page_size)
            .cloned()
            .collect()
    }

    pub fn instance_version(&self, workflow_id: &str, instance_id: &str) -> Option<String> {
        self.instance_versions
            .get(&(workflow_id.to_string(), instance_id.to_string()))
            .map(|v| v.clone())
    }

    // -- plumbing ----------------------------------------------------------

    fn instance_lock(&self, run_key: &RunKey) -> Arc<tokio::sync::Mutex<()>> {
        self.instance_locks
            .entry(run_key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn trace(&self, workflow_id: &str, instance_id: &str, step: Option<&str>, kind: TraceEventKind) {
        if let Some(tracer) = &self.ctx.tracer {
            tracer.record(crate::trace::TraceEvent::new(
                self.ctx.now_millis(),
                workflow_id,
                instance_id,
                step.map(str::to_string),
                kind,
            ));
        }
    }
}

impl<S: RuntimeStore + 'static> Broker<S> {
    /// Spawn the periodic lease/worker reaper. Abort the handle to stop it.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let period = Duration::from_secs_f64(broker.config.reap_interval_secs.max(0.01));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let now = broker.ctx.now_millis();
                if let Err(err) = broker.reap(now).await {
                    warn!(error = %err, "reaper pass failed");
                }
            }
        })
    }
}

impl Broker<crate::storage::MemoryRuntimeStore> {
    /// Broker over an in-memory store; backbone of the in-process engines.
    pub fn in_memory(ctx: RuntimeContext) -> Self {
        Self::new(
            crate::storage::MemoryRuntimeStore::new(),
            BrokerConfig::default(),
            ctx,
        )
    }
}

fn validate_inputs(schema: &WorkflowSchema, inputs: &HashMap<String, Value>) -> WorkflowResult<()> {
    let declared: HashSet<&str> = schema.input_keys.iter().map(String::as_str).collect();
    for key in inputs.keys() {
        if !declared.contains(key.as_str()) {
            return Err(WorkflowError::InputValidation(format!(
                "unexpected input '{key}'"
            )));
        }
    }
    for key in &declared {
        if !inputs.contains_key(*key) {
            return Err(WorkflowError::InputValidation(format!(
                "missing input '{key}'"
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl<S: RuntimeStore> BrokerApi for Broker<S> {
    async fn register_worker(&self, schemas: Vec<WorkflowSchema>) -> WorkflowResult<String> {
        Broker::register_worker(self, schemas).await
    }

    async fn dispatch(
        &self,
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
    ) -> WorkflowResult<String> {
        Broker::dispatch(self, workflow, inputs).await
    }

    async fn get_step(&self, worker_id: &str) -> WorkflowResult<Option<Assignment>> {
        Broker::get_step(self, worker_id).await
    }

    async fn report_step(&self, worker_id: &str, report: StepReport) -> WorkflowResult<()> {
        Broker::report_step(self, worker_id, report).await
    }

    async fn keep_alive(&self, worker_id: &str) -> WorkflowResult<()> {
        Broker::keep_alive(self, worker_id).await
    }
}

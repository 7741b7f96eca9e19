//! Broker-level scenarios: leases, the reaper, worker liveness, instance
//! cancellation and the trace stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use stepflow::{
    execute_assignment, Broker, BrokerConfig, FakeTimeProvider, FnStep, MemoryRuntimeStore,
    MemoryTracer, RuntimeContext, RuntimeStore, Status, StepDef, StepReport, TimeProvider,
    TraceEventKind, Workflow, WorkerConfig, WorkerEngine, WorkflowError,
};

struct Harness {
    broker: Arc<Broker<MemoryRuntimeStore>>,
    time: Arc<FakeTimeProvider>,
    tracer: Arc<MemoryTracer>,
}

fn harness() -> Harness {
    let time = Arc::new(FakeTimeProvider::new(1_000));
    let tracer = Arc::new(MemoryTracer::new());
    let ctx = RuntimeContext::default()
        .with_time_provider(time.clone())
        .with_tracer(tracer.clone());
    Harness {
        broker: Arc::new(Broker::new(
            MemoryRuntimeStore::new(),
            BrokerConfig::default(),
            ctx,
        )),
        time,
        tracer,
    }
}

fn counted_workflow(calls: Arc<AtomicU32>) -> Workflow {
    Workflow::builder("wf", "1")
        .add_step(StepDef::new(
            "s",
            FnStep::from_sync(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!("done"))
            }),
        ))
        .output("s")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_lease_reclaim_allows_second_worker_to_finish() {
    let h = harness();
    let calls = Arc::new(AtomicU32::new(0));
    let wf = counted_workflow(calls.clone());

    let w1 = h
        .broker
        .register_worker(vec![wf.schema().clone()])
        .await
        .unwrap();
    let w2 = h
        .broker
        .register_worker(vec![wf.schema().clone()])
        .await
        .unwrap();
    let instance = h.broker.dispatch(&wf, HashMap::new()).await.unwrap();

    // Worker 1 leases the step and disappears without reporting.
    let stuck = h.broker.get_step(&w1).await.unwrap().unwrap();
    assert_eq!(stuck.step_name, "s");
    assert!(h.broker.get_step(&w2).await.unwrap().is_none());

    // Past the deadline the reaper reverts the step to PENDING.
    h.time.advance_millis(61_000);
    h.broker.reap(h.time.now_millis()).await.unwrap();
    assert_eq!(h.broker.reclaim_count("wf", &instance, "s"), 1);
    assert_eq!(
        h.broker.store().get_state("wf", &instance, "s").await.unwrap(),
        Some(Status::Pending)
    );

    // Worker 2 picks it up and actually executes it.
    let assignment = h.broker.get_step(&w2).await.unwrap().unwrap();
    let report = execute_assignment(&wf, &assignment, &RuntimeContext::default()).await;
    h.broker.report_step(&w2, report).await.unwrap();

    let record = h
        .broker
        .store()
        .run_record("wf", &instance)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, Status::Succeeded);
    // Worker 1 leased but never ran the body; worker 2 ran it once.
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Worker 1's late report lands on a terminal step: accepted, no effect.
    let late = h
        .broker
        .report_step(&w1, StepReport::succeeded(&stuck, json!("late")))
        .await;
    assert!(late.is_ok());
}

#[tokio::test]
async fn test_late_report_on_requeued_step_is_lease_mismatch() {
    let h = harness();
    let wf = counted_workflow(Arc::new(AtomicU32::new(0)));
    let w1 = h
        .broker
        .register_worker(vec![wf.schema().clone()])
        .await
        .unwrap();
    h.broker.dispatch(&wf, HashMap::new()).await.unwrap();

    let stuck = h.broker.get_step(&w1).await.unwrap().unwrap();
    h.time.advance_millis(61_000);
    h.broker.reap(h.time.now_millis()).await.unwrap();

    // Step is PENDING again; the old lease no longer exists.
    let err = h
        .broker
        .report_step(&w1, StepReport::succeeded(&stuck, json!("late")))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::LeaseMismatch { .. }));
}

#[tokio::test]
async fn test_dead_worker_is_pruned_and_its_lease_reclaimed() {
    let h = harness();
    let wf = counted_workflow(Arc::new(AtomicU32::new(0)));
    let w1 = h
        .broker
        .register_worker(vec![wf.schema().clone()])
        .await
        .unwrap();
    let instance = h.broker.dispatch(&wf, HashMap::new()).await.unwrap();
    h.broker.get_step(&w1).await.unwrap().unwrap();

    // Silence for longer than the worker timeout.
    h.time.advance_millis(301_000);
    h.broker.reap(h.time.now_millis()).await.unwrap();

    assert!(h.broker.list_workers().is_empty());
    assert_eq!(
        h.broker.store().get_state("wf", &instance, "s").await.unwrap(),
        Some(Status::Pending)
    );
}

#[tokio::test]
async fn test_keep_alive_prevents_pruning() {
    let h = harness();
    let wf = counted_workflow(Arc::new(AtomicU32::new(0)));
    let w1 = h
        .broker
        .register_worker(vec![wf.schema().clone()])
        .await
        .unwrap();
    h.time.advance_millis(200_000);
    h.broker.keep_alive(&w1).await.unwrap();
    h.time.advance_millis(200_000);
    h.broker.reap(h.time.now_millis()).await.unwrap();
    assert_eq!(h.broker.list_workers().len(), 1);
}

#[tokio::test]
async fn test_cancel_instance_marks_rest_cancelled() {
    let h = harness();
    let wf = Workflow::builder("wf", "1")
        .add_step(StepDef::new("a", FnStep::from_sync(|_| Ok(json!(1)))))
        .add_step(StepDef::new("b", FnStep::from_sync(|_| Ok(json!(2)))))
        .then("a", "b")
        .build()
        .unwrap();
    let w1 = h
        .broker
        .register_worker(vec![wf.schema().clone()])
        .await
        .unwrap();
    let instance = h.broker.dispatch(&wf, HashMap::new()).await.unwrap();

    // Complete "a", then cancel before "b" runs.
    let assignment = h.broker.get_step(&w1).await.unwrap().unwrap();
    h.broker
        .report_step(&w1, StepReport::succeeded(&assignment, json!(1)))
        .await
        .unwrap();
    h.broker.cancel_instance("wf", &instance).await.unwrap();

    assert_eq!(
        h.broker.store().get_state("wf", &instance, "a").await.unwrap(),
        Some(Status::Succeeded)
    );
    assert_eq!(
        h.broker.store().get_state("wf", &instance, "b").await.unwrap(),
        Some(Status::Cancelled)
    );
    let record = h
        .broker
        .store()
        .run_record("wf", &instance)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, Status::Failed);
    assert!(record.is_finished());

    // No work remains after cancellation.
    assert!(h.broker.get_step(&w1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_trace_stream_for_simple_run() {
    let h = harness();
    let wf = counted_workflow(Arc::new(AtomicU32::new(0)));
    let engine = WorkerEngine::connect(
        h.broker.clone(),
        vec![wf.clone()],
        WorkerConfig::default(),
        RuntimeContext::default(),
    )
    .await
    .unwrap();
    h.broker.dispatch(&wf, HashMap::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    let kinds: Vec<(Option<String>, TraceEventKind)> = h
        .tracer
        .events()
        .into_iter()
        .map(|e| (e.step_name, e.event))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (None, TraceEventKind::Start),
            (Some("s".into()), TraceEventKind::Start),
            (Some("s".into()), TraceEventKind::Success),
            (None, TraceEventKind::Success),
        ]
    );
}

#[tokio::test]
async fn test_worker_listing_reports_last_task() {
    let h = harness();
    let wf = counted_workflow(Arc::new(AtomicU32::new(0)));
    let engine = WorkerEngine::connect(
        h.broker.clone(),
        vec![wf.clone()],
        WorkerConfig::default(),
        RuntimeContext::default(),
    )
    .await
    .unwrap();
    let instance = h.broker.dispatch(&wf, HashMap::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();

    let workers = h.broker.list_workers();
    assert_eq!(workers.len(), 1);
    let last_task = workers[0].last_task.clone().unwrap();
    assert_eq!(last_task.step_name, "s");
    assert_eq!(last_task.instance_id, instance);
    assert!(last_task.success);

    let workflows = h.broker.list_workflows();
    assert_eq!(workflows.len(), 1);
    assert_eq!(workflows[0].workflow_id, "wf");
}

#[tokio::test]
async fn test_queue_never_double_leases() {
    // Two workers polling one instance: each assignment goes to exactly one.
    let h = harness();
    let wf = Workflow::builder("wide", "1")
        .add_step(StepDef::new("a", FnStep::from_sync(|_| Ok(Value::Null))))
        .add_step(StepDef::new("b", FnStep::from_sync(|_| Ok(Value::Null))))
        .add_step(StepDef::new("c", FnStep::from_sync(|_| Ok(Value::Null))))
        .build()
        .unwrap();
    let w1 = h
        .broker
        .register_worker(vec![wf.schema().clone()])
        .await
        .unwrap();
    let w2 = h
        .broker
        .register_worker(vec![wf.schema().clone()])
        .await
        .unwrap();
    h.broker.dispatch(&wf, HashMap::new()).await.unwrap();

    let mut seen = Vec::new();
    loop {
        let a = h.broker.get_step(&w1).await.unwrap();
        let b = h.broker.get_step(&w2).await.unwrap();
        if a.is_none() && b.is_none() {
            break;
        }
        for assignment in [a, b].into_iter().flatten() {
            seen.push(assignment.step_name.clone());
        }
    }
    seen.sort();
    assert_eq!(seen, vec!["a", "b", "c"]);
}

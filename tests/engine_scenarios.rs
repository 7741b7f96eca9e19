//! End-to-end runs of the in-process engines: branching, joins, retries,
//! condition gates and cancellation cascades.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use stepflow::{
    AsyncEngine, ExecutionEngine, FnStep, PoolEngine, RuntimeStore, SerialEngine, Status, StepDef,
    StepError, StepPolicy, Workflow,
};

fn noop(name: &str) -> StepDef {
    let tag = json!(name);
    StepDef::new(name, FnStep::new(move |_| {
        let tag = tag.clone();
        async move { Ok(tag) }
    }))
}

fn failing(name: &str) -> StepDef {
    StepDef::new(name, FnStep::from_sync(|_| Err(StepError::failed("boom"))))
}

async fn states_of(
    broker: &stepflow::Broker<stepflow::MemoryRuntimeStore>,
    workflow: &Workflow,
    instance_id: &str,
) -> HashMap<String, Status> {
    let mut states = HashMap::new();
    for name in workflow.schema().steps.keys() {
        let state = broker
            .store()
            .get_state(workflow.workflow_id(), instance_id, name)
            .await
            .unwrap()
            .unwrap();
        states.insert(name.clone(), state);
    }
    states
}

/// Drive a workflow through the broker directly so step states stay
/// observable after the run.
async fn run_observed(
    workflow: &Workflow,
    inputs: HashMap<String, Value>,
) -> (
    Arc<stepflow::Broker<stepflow::MemoryRuntimeStore>>,
    String,
    Status,
) {
    let broker = Arc::new(stepflow::Broker::in_memory(Default::default()));
    let engine = stepflow::WorkerEngine::connect(
        broker.clone(),
        vec![workflow.clone()],
        Default::default(),
        Default::default(),
    )
    .await
    .unwrap();
    let instance = broker.dispatch(workflow, inputs).await.unwrap();
    engine.run_until_idle().await.unwrap();
    let status = broker
        .store()
        .run_record(workflow.workflow_id(), &instance)
        .await
        .unwrap()
        .unwrap()
        .status;
    (broker, instance, status)
}

async fn state(
    broker: &stepflow::Broker<stepflow::MemoryRuntimeStore>,
    workflow_id: &str,
    instance: &str,
    step: &str,
) -> Status {
    broker
        .store()
        .get_state(workflow_id, instance, step)
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_single_step_succeeds() {
    let wf = Workflow::builder("single", "1")
        .add_step(noop("s"))
        .output("s")
        .build()
        .unwrap();
    let (broker, instance, status) = run_observed(&wf, HashMap::new()).await;
    assert_eq!(status, Status::Succeeded);
    assert_eq!(state(&broker, "single", &instance, "s").await, Status::Succeeded);
}

#[tokio::test]
async fn test_fail_fast_cancels_downstream() {
    let wf = Workflow::builder("chain", "1")
        .add_step(failing("a"))
        .add_step(noop("b"))
        .add_step(noop("c"))
        .then("a", "b")
        .then("b", "c")
        .build()
        .unwrap();
    let (broker, instance, status) = run_observed(&wf, HashMap::new()).await;
    assert_eq!(status, Status::Failed);
    assert_eq!(state(&broker, "chain", &instance, "a").await, Status::Failed);
    assert_eq!(state(&broker, "chain", &instance, "b").await, Status::Cancelled);
    assert_eq!(state(&broker, "chain", &instance, "c").await, Status::Cancelled);
}

#[tokio::test]
async fn test_branch_choice_cancels_other_branch() {
    let wf = Workflow::builder("branch", "1")
        .add_step(StepDef::new(
            "chooser",
            FnStep::from_sync(|_| Ok(json!("skip"))),
        ))
        .add_step(noop("x"))
        .add_step(noop("y"))
        .then("chooser", "x")
        .then_on("chooser", "skip", "y")
        .build()
        .unwrap();
    let (broker, instance, status) = run_observed(&wf, HashMap::new()).await;
    assert_eq!(status, Status::Failed);
    assert_eq!(state(&broker, "branch", &instance, "y").await, Status::Succeeded);
    assert_eq!(state(&broker, "branch", &instance, "x").await, Status::Cancelled);
}

#[tokio::test]
async fn test_unmatched_action_falls_back_to_default() {
    let wf = Workflow::builder("fallback", "1")
        .add_step(StepDef::new(
            "chooser",
            FnStep::from_sync(|_| Ok(json!("no-such-action"))),
        ))
        .add_step(noop("x"))
        .then("chooser", "x")
        .build()
        .unwrap();
    let (broker, instance, status) = run_observed(&wf, HashMap::new()).await;
    assert_eq!(status, Status::Succeeded);
    assert_eq!(state(&broker, "fallback", &instance, "x").await, Status::Succeeded);
}

#[tokio::test]
async fn test_retry_recovers_with_exact_invocations() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let wf = Workflow::builder("retry", "1")
        .add_step(
            StepDef::new(
                "flaky",
                FnStep::from_sync(move |_| {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(StepError::failed("not yet"))
                    } else {
                        Ok(json!("recovered"))
                    }
                }),
            )
            .max_retries(3)
            .wait(0.0),
        )
        .output("flaky")
        .build()
        .unwrap();
    let outcome = SerialEngine::new().execute(&wf, HashMap::new()).await.unwrap();
    assert_eq!(outcome.status, Status::Succeeded);
    assert_eq!(outcome.output(), Some(&json!("recovered")));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_and_join_runs_after_both_predecessors() {
    let wf = Workflow::builder("join", "1")
        .add_step(noop("a"))
        .add_step(noop("b"))
        .add_step(noop("c"))
        .then("a", "c")
        .then("b", "c")
        .build()
        .unwrap();
    let (broker, instance, status) = run_observed(&wf, HashMap::new()).await;
    assert_eq!(status, Status::Succeeded);
    assert_eq!(state(&broker, "join", &instance, "c").await, Status::Succeeded);
}

#[tokio::test]
async fn test_and_join_cancelled_when_one_predecessor_fails() {
    let wf = Workflow::builder("join", "1")
        .add_step(noop("a"))
        .add_step(failing("b"))
        .add_step(noop("c"))
        .then("a", "c")
        .then("b", "c")
        .build()
        .unwrap();
    let (broker, instance, status) = run_observed(&wf, HashMap::new()).await;
    assert_eq!(status, Status::Failed);
    assert_eq!(state(&broker, "join", &instance, "a").await, Status::Succeeded);
    assert_eq!(state(&broker, "join", &instance, "c").await, Status::Cancelled);
}

#[tokio::test]
async fn test_or_join_ready_after_first_predecessor() {
    let wf = Workflow::builder("orjoin", "1")
        .add_step(noop("a"))
        .add_step(failing("b"))
        .add_step(noop("c").or_join())
        .then("a", "c")
        .then("b", "c")
        .build()
        .unwrap();
    let (broker, instance, status) = run_observed(&wf, HashMap::new()).await;
    // The failed predecessor does not prevent readiness.
    assert_eq!(state(&broker, "orjoin", &instance, "c").await, Status::Succeeded);
    assert_eq!(status, Status::Failed);
}

#[tokio::test]
async fn test_or_join_cancelled_when_all_predecessors_fail() {
    let wf = Workflow::builder("orjoin", "1")
        .add_step(failing("a"))
        .add_step(failing("b"))
        .add_step(noop("c").or_join())
        .then("a", "c")
        .then("b", "c")
        .build()
        .unwrap();
    let (broker, instance, status) = run_observed(&wf, HashMap::new()).await;
    assert_eq!(status, Status::Failed);
    assert_eq!(state(&broker, "orjoin", &instance, "c").await, Status::Cancelled);
}

#[tokio::test]
async fn test_typed_dependency_carries_results() {
    let wf = Workflow::builder("math", "1")
        .add_step(
            StepDef::new(
                "add",
                FnStep::from_sync(|ctx| Ok(json!(ctx.require_f64("x")? + ctx.require_f64("y")?))),
            )
            .input("x", "x")
            .input("y", "y"),
        )
        .add_step(
            StepDef::new(
                "multiply",
                FnStep::from_sync(|ctx| Ok(json!(ctx.require_f64("value")? * 2.0))),
            )
            .depends_on("value", "add"),
        )
        .input_key("x")
        .input_key("y")
        .output("multiply")
        .build()
        .unwrap();
    let inputs: HashMap<String, Value> =
        [("x".to_string(), json!(2)), ("y".to_string(), json!(3))]
            .into_iter()
            .collect();
    let outcome = wf.run(inputs).await.unwrap();
    assert_eq!(outcome.status, Status::Succeeded);
    assert_eq!(outcome.output(), Some(&json!(10.0)));
}

#[tokio::test]
async fn test_condition_gate_skips_step_and_successors_proceed() {
    let wf = Workflow::builder("gated", "1")
        .add_step(
            noop("guarded").condition("flag", |ctx| {
                ctx.get("flag").and_then(Value::as_bool).unwrap_or(false)
            }),
        )
        .add_step(noop("after"))
        .then("guarded", "after")
        .input_key("flag")
        .build()
        .unwrap();

    let inputs: HashMap<String, Value> = [("flag".to_string(), json!(false))].into_iter().collect();
    let (broker, instance, status) = run_observed(&wf, inputs).await;
    assert_eq!(status, Status::Succeeded);
    assert_eq!(
        state(&broker, "gated", &instance, "guarded").await,
        Status::Skipped
    );
    // Successors treat the skipped predecessor as if it succeeded.
    assert_eq!(state(&broker, "gated", &instance, "after").await, Status::Succeeded);

    let inputs: HashMap<String, Value> = [("flag".to_string(), json!(true))].into_iter().collect();
    let (broker, instance, _) = run_observed(&wf, inputs).await;
    assert_eq!(
        state(&broker, "gated", &instance, "guarded").await,
        Status::Succeeded
    );
}

#[tokio::test]
async fn test_conditional_binding_skips_on_false() {
    let wf = Workflow::builder("condbind", "1")
        .add_step(StepDef::new(
            "source",
            FnStep::from_sync(|_| Ok(json!(-1.0))),
        ))
        .add_step(StepDef::new(
            "sink",
            FnStep::from_sync(|ctx| Ok(ctx.require("value")?.clone())),
        )
        .depends_on_if("value", "source", "positive", |v| {
            v.as_f64().map(|f| f > 0.0).unwrap_or(false)
        }))
        .build()
        .unwrap();
    let (broker, instance, status) = run_observed(&wf, HashMap::new()).await;
    assert_eq!(status, Status::Succeeded);
    assert_eq!(
        state(&broker, "condbind", &instance, "sink").await,
        Status::Skipped
    );
}

#[tokio::test]
async fn test_timeout_policy_fails_step() {
    let wf = Workflow::builder("slow", "1")
        .add_step(
            StepDef::new(
                "sleepy",
                FnStep::new(|_| async {
                    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                    Ok(Value::Null)
                }),
            )
            .policy(StepPolicy::timeout(0.05)),
        )
        .add_step(noop("after"))
        .then("sleepy", "after")
        .build()
        .unwrap();
    let (broker, instance, status) = run_observed(&wf, HashMap::new()).await;
    assert_eq!(status, Status::Failed);
    assert_eq!(state(&broker, "slow", &instance, "sleepy").await, Status::Failed);
    assert_eq!(state(&broker, "slow", &instance, "after").await, Status::Cancelled);
}

#[tokio::test]
async fn test_all_engines_agree_on_fork_join() {
    let build = || {
        Workflow::builder("forkjoin", "1")
            .add_step(noop("root"))
            .add_step(noop("left"))
            .add_step(noop("right"))
            .add_step(
                StepDef::new("join", FnStep::from_sync(|ctx| {
                    Ok(json!([ctx.require("l")?, ctx.require("r")?]))
                }))
                .depends_on("l", "left")
                .depends_on("r", "right"),
            )
            .then("root", "left")
            .then("root", "right")
            .output("join")
            .build()
            .unwrap()
    };
    let expected = json!(["left", "right"]);

    let serial = SerialEngine::new()
        .execute(&build(), HashMap::new())
        .await
        .unwrap();
    assert_eq!(serial.output(), Some(&expected));

    let pool = PoolEngine::new(2)
        .execute(&build(), HashMap::new())
        .await
        .unwrap();
    assert_eq!(pool.output(), Some(&expected));

    let async_engine = AsyncEngine::new()
        .execute(&build(), HashMap::new())
        .await
        .unwrap();
    assert_eq!(async_engine.output(), Some(&expected));
}

#[tokio::test]
async fn test_every_step_reaches_terminal_state() {
    // Mixed graph: a branch, a failure and an AND-join; nothing may be left
    // PENDING or RUNNING once the run finalizes.
    let wf = Workflow::builder("mixed", "1")
        .add_step(StepDef::new(
            "chooser",
            FnStep::from_sync(|_| Ok(json!("alt"))),
        ))
        .add_step(failing("alt_path"))
        .add_step(noop("main_path"))
        .add_step(noop("tail"))
        .then("chooser", "main_path")
        .then_on("chooser", "alt", "alt_path")
        .then("alt_path", "tail")
        .then("main_path", "tail")
        .build()
        .unwrap();
    let (broker, instance, status) = run_observed(&wf, HashMap::new()).await;
    assert_eq!(status, Status::Failed);
    for (name, state) in states_of(&broker, &wf, &instance).await {
        assert!(state.is_terminal(), "step {name} ended non-terminal: {state:?}");
    }
}

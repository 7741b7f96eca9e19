//! stepflow — a workflow orchestrator.
//!
//! Authors describe computations as DAGs of typed steps. The same graph can
//! run three ways: in-process through [`SerialEngine`], [`PoolEngine`] or
//! [`AsyncEngine`]; or distributed, with a [`Broker`] leasing ready steps to
//! [`WorkerEngine`]s that execute them under retry/timeout policies and
//! report back.

pub mod broker;
pub mod engine;
pub mod error;
pub mod graph;
pub mod policy;
pub mod runtime;
pub mod schema;
pub mod status;
pub mod storage;
pub mod trace;
pub mod worker;
pub mod workflow;

pub use crate::broker::{
    Assignment, AssignmentPayload, Broker, BrokerApi, BrokerConfig, BrokerStatus, LastTask,
    RepositoryInfo, StepReport, WorkerInfo, WorkflowInfo,
};
pub use crate::engine::{AsyncEngine, ExecutionEngine, PoolEngine, RunOutcome, SerialEngine};
pub use crate::error::{StepError, StorageError, WorkflowError, WorkflowResult};
pub use crate::policy::{
    CustomStepPolicy, FailureAction, FailureDecision, RetryPolicy, StepPolicy, TimeoutPolicy,
    TracePolicy, WorkflowPolicy,
};
pub use crate::runtime::{
    FakeIdGenerator, FakeTimeProvider, IdGenerator, RealIdGenerator, RealTimeProvider,
    RuntimeContext, TimeProvider,
};
pub use crate::schema::{
    parse_schema, write_schema, Binding, JoinMode, PolicyConfig, SchemaFormat, StepSchema,
    WorkflowSchema, DEFAULT_ACTION,
};
pub use crate::status::Status;
pub use crate::storage::{MemoryRuntimeStore, RunRecord, RuntimeStore, StoredAssignment};
#[cfg(feature = "sqlite")]
pub use crate::storage::SqliteRuntimeStore;
pub use crate::trace::{LogTracer, MemoryTracer, TraceEvent, TraceEventKind, Tracer};
pub use crate::worker::{execute_assignment, worker_processes_from_env, WorkerConfig, WorkerEngine};
pub use crate::workflow::{
    Condition, FnStep, StepContext, StepDef, StepHandler, StepRegistry, Workflow, WorkflowBuilder,
};

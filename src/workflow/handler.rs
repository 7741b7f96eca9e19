use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::StepError;

/// Inputs handed to a step body for one attempt.
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    pub step_name: String,
    /// Parameters resolved from the step's bindings.
    pub args: HashMap<String, Value>,
    /// The workflow inputs of this instance.
    pub workflow_inputs: HashMap<String, Value>,
    /// Results of every finished predecessor, by step name.
    pub results: HashMap<String, Value>,
}

impl StepContext {
    /// Look up a bound parameter, falling back to the workflow inputs.
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name).or_else(|| self.workflow_inputs.get(name))
    }

    /// Like [`StepContext::arg`] but missing parameters are an error.
    pub fn require(&self, name: &str) -> Result<&Value, StepError> {
        self.arg(name).ok_or_else(|| StepError::MissingInput {
            param: name.to_string(),
        })
    }

    /// Required numeric parameter.
    pub fn require_f64(&self, name: &str) -> Result<f64, StepError> {
        self.require(name)?
            .as_f64()
            .ok_or_else(|| StepError::failed(format!("parameter '{name}' is not a number")))
    }
}

/// A step body. Implementations are registered by class name and shared
/// across instances, so they must be stateless or internally synchronized.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, ctx: StepContext) -> Result<Value, StepError>;
}

/// Condition gate: evaluated against the workflow inputs at dispatch time,
/// or against a dependency value for conditional bindings.
pub type Condition = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

type AsyncStepFn = dyn Fn(StepContext) -> BoxFuture<'static, Result<Value, StepError>> + Send + Sync;

/// [`StepHandler`] built from a closure.
#[derive(Clone)]
pub struct FnStep {
    f: Arc<AsyncStepFn>,
}

impl FnStep {
    /// Wrap an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |ctx| -> BoxFuture<'static, Result<Value, StepError>> {
                Box::pin(f(ctx))
            }),
        }
    }

    /// Wrap a synchronous closure.
    pub fn from_sync<F>(f: F) -> Self
    where
        F: Fn(&StepContext) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        Self {
            f: Arc::new(move |ctx| -> BoxFuture<'static, Result<Value, StepError>> {
                let out = f(&ctx);
                Box::pin(async move { out })
            }),
        }
    }
}

#[async_trait]
impl StepHandler for FnStep {
    async fn run(&self, ctx: StepContext) -> Result<Value, StepError> {
        (self.f)(ctx).await
    }
}

/// Registry of step handlers by class name and condition gates by name.
///
/// Workers use it to reconstruct runtime workflows from schemas received
/// over the wire.
#[derive(Default)]
pub struct StepRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
    conditions: HashMap<String, Condition>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: impl Into<String>, handler: impl StepHandler + 'static) {
        self.handlers.insert(class.into(), Arc::new(handler));
    }

    pub fn register_arc(&mut self, class: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(class.into(), handler);
    }

    pub fn register_condition<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.conditions.insert(name.into(), Arc::new(f));
    }

    pub fn handler(&self, class: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(class).cloned()
    }

    pub fn condition(&self, name: &str) -> Option<Condition> {
        self.conditions.get(name).cloned()
    }
}

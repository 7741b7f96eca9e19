//! Runtime context providing time, id generation and tracing.
//!
//! Every component that needs a clock, fresh identifiers or a trace sink
//! receives them through a [`RuntimeContext`] instead of reaching for
//! globals, so tests can pin time and ids.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::trace::Tracer;

/// Shared handles injected into the broker, the worker engine and the
/// in-process engines.
#[derive(Clone)]
pub struct RuntimeContext {
    pub time_provider: Arc<dyn TimeProvider>,
    pub id_generator: Arc<dyn IdGenerator>,
    pub tracer: Option<Arc<dyn Tracer>>,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self {
            time_provider: Arc::new(RealTimeProvider),
            id_generator: Arc::new(RealIdGenerator),
            tracer: None,
        }
    }
}

impl RuntimeContext {
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn with_time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    /// Current time in unix milliseconds.
    pub fn now_millis(&self) -> i64 {
        self.time_provider.now_millis()
    }
}

pub trait TimeProvider: Send + Sync {
    /// Unix timestamp in milliseconds.
    fn now_millis(&self) -> i64;
}

pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

// --- Real implementations ---

pub struct RealTimeProvider;

impl TimeProvider for RealTimeProvider {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

pub struct RealIdGenerator;

impl IdGenerator for RealIdGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

// --- Fake implementations ---

/// Manually advanced clock for tests.
pub struct FakeTimeProvider {
    millis: AtomicU64,
}

impl FakeTimeProvider {
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: AtomicU64::new(start_millis.max(0) as u64),
        }
    }

    pub fn advance_millis(&self, delta: u64) {
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }
}

impl TimeProvider for FakeTimeProvider {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst) as i64
    }
}

/// Sequential ids with a fixed prefix for tests.
pub struct FakeIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl FakeIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for FakeIdGenerator {
    fn next_id(&self) -> String {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", self.prefix, id)
    }
}

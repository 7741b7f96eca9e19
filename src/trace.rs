//! Trace event model and sinks.
//!
//! The broker, the worker engine and the in-process engines emit an
//! append-only stream of [`TraceEvent`]s through a [`Tracer`]. The crate
//! ships an in-memory collector for tests and a sink that forwards to the
//! `tracing` ecosystem; file sinks live outside the core.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Kind of lifecycle event recorded for a step or instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceEventKind {
    Start,
    Success,
    Failure,
    Skip,
    Cancel,
    Retry,
}

/// One entry in the trace stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub timestamp_ms: i64,
    pub workflow_id: String,
    pub instance_id: String,
    /// `None` for instance-level events (start/finish of the whole run).
    pub step_name: Option<String>,
    pub event: TraceEventKind,
}

impl TraceEvent {
    pub fn new(
        timestamp_ms: i64,
        workflow_id: impl Into<String>,
        instance_id: impl Into<String>,
        step_name: Option<String>,
        event: TraceEventKind,
    ) -> Self {
        Self {
            timestamp_ms,
            workflow_id: workflow_id.into(),
            instance_id: instance_id.into(),
            step_name,
            event,
        }
    }

    /// Event timestamp as a UTC datetime.
    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp_ms).unwrap_or_default()
    }
}

/// Append-only sink for trace events.
pub trait Tracer: Send + Sync {
    fn record(&self, event: TraceEvent);
}

/// Collects events in memory; used by tests and the in-process engines.
#[derive(Default)]
pub struct MemoryTracer {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemoryTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Drain the recorded events.
    pub fn take(&self) -> Vec<TraceEvent> {
        std::mem::take(&mut self.events.lock())
    }
}

impl Tracer for MemoryTracer {
    fn record(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}

/// Forwards events to the `tracing` subscriber at debug level.
pub struct LogTracer;

impl Tracer for LogTracer {
    fn record(&self, event: TraceEvent) {
        tracing::debug!(
            workflow_id = %event.workflow_id,
            instance_id = %event.instance_id,
            step = event.step_name.as_deref().unwrap_or("-"),
            at = %event.timestamp(),
            "trace: {:?}",
            event.event
        );
    }
}

//! Graph construction and validation.
//!
//! [`build_graph`] lifts a [`WorkflowSchema`](crate::schema::WorkflowSchema)
//! into a petgraph structure, reconciling declared predecessors with the
//! successor edges, deduplicating repeated edges and rejecting malformed
//! graphs (cycles, dangling references, conflicting action edges).

mod builder;
mod types;
mod validator;

pub use builder::{build_graph, WorkflowGraph};
pub use types::{GraphEdge, GraphStep, StepIndexMap};
pub use validator::validate_graph;

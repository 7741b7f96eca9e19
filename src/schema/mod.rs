//! Serializable workflow schema.
//!
//! The schema is the wire form of a workflow graph: the broker registers it,
//! workers ship it at registration, and it round-trips losslessly through
//! YAML and JSON. Runtime behaviour (handlers, condition closures) attaches
//! to a schema via [`crate::workflow`].

mod model;
mod parser;

pub use model::{
    Binding, JoinMode, PolicyConfig, StepSchema, WorkflowSchema, DEFAULT_ACTION,
};
pub use parser::{parse_schema, write_schema, SchemaFormat};

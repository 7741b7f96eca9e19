//! Runtime workflow model.
//!
//! A [`Workflow`] pairs the serializable [`WorkflowSchema`](crate::schema::WorkflowSchema)
//! with the behaviour the schema cannot carry: step handlers, condition
//! closures and custom policies. Workflows are built either programmatically
//! through [`WorkflowBuilder`] or from a parsed schema plus a
//! [`StepRegistry`].

mod builder;
mod handler;
mod step;
#[allow(clippy::module_inception)]
mod workflow;

pub use builder::WorkflowBuilder;
pub use handler::{Condition, FnStep, StepContext, StepHandler, StepRegistry};
pub use step::StepDef;
pub use workflow::Workflow;

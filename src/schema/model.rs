use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Action label used when a step does not pick an explicit branch.
pub const DEFAULT_ACTION: &str = "default";

/// Serializable workflow structure exchanged with the broker.
///
/// `(workflow_id, version)` is the schema identity; registering a different
/// definition under an existing identity is a conflict. All maps are ordered
/// so serialize -> deserialize -> re-serialize is bit-identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSchema {
    pub workflow_id: String,
    pub version: String,
    pub steps: BTreeMap<String, StepSchema>,
    /// Terminal steps whose results form the workflow result, in order.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Declared input parameter names the workflow accepts.
    #[serde(default)]
    pub input_keys: Vec<String>,
}

impl WorkflowSchema {
    /// Schema identity pair.
    pub fn key(&self) -> (String, String) {
        (self.workflow_id.clone(), self.version.clone())
    }

    /// Fill empty predecessor sets from the successor edges.
    ///
    /// Hand-written schemas may declare edges only on the source side; the
    /// broker and the graph builder work on the normalized form.
    pub fn normalized(mut self) -> Self {
        let mut derived: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, step) in &self.steps {
            for (_, target) in step.edges() {
                derived
                    .entry(target.to_string())
                    .or_default()
                    .insert(name.clone());
            }
        }
        for (name, step) in self.steps.iter_mut() {
            if step.predecessors.is_empty() {
                if let Some(preds) = derived.remove(name) {
                    step.predecessors = preds;
                }
            }
        }
        self
    }
}

/// One step in the serialized graph.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepSchema {
    /// Handler registry key; resolved by the worker that executes the step.
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub predecessors: BTreeSet<String>,
    /// Outgoing edges grouped by action label.
    #[serde(default)]
    pub successors: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub join_mode: JoinMode,
    /// Parameter name -> value source.
    #[serde(default)]
    pub bindings: BTreeMap<String, Binding>,
    /// Names of condition gates evaluated at dispatch time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<PolicyConfig>,
}

impl StepSchema {
    /// Iterate every outgoing target with its action label.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.successors
            .iter()
            .flat_map(|(action, targets)| targets.iter().map(move |t| (action.as_str(), t.as_str())))
    }

    /// The step's timeout policy, if one is configured.
    pub fn timeout_secs(&self) -> Option<f64> {
        self.policies.iter().find_map(|p| match p {
            PolicyConfig::Timeout { seconds } => Some(*seconds),
            _ => None,
        })
    }
}

/// How a step with multiple predecessors becomes ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JoinMode {
    /// Ready once every predecessor finished successfully and at least one
    /// selected the edge.
    #[default]
    And,
    /// Ready as soon as any predecessor finished successfully and selected
    /// the edge.
    Or,
}

/// Source of a step parameter, resolved by the broker at lease time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Binding {
    /// Value of a workflow input key.
    WorkflowInput { key: String },
    /// Result of another step.
    StepOutput { step: String },
    /// Result of another step, gated by a named condition; a false gate
    /// skips the step instead of running it.
    ConditionalStepOutput { step: String, condition: String },
}

impl Binding {
    pub fn workflow_input(key: impl Into<String>) -> Self {
        Binding::WorkflowInput { key: key.into() }
    }

    pub fn step_output(step: impl Into<String>) -> Self {
        Binding::StepOutput { step: step.into() }
    }

    pub fn conditional_step_output(
        step: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        Binding::ConditionalStepOutput {
            step: step.into(),
            condition: condition.into(),
        }
    }

    /// The upstream step this binding depends on, if any.
    pub fn dependency(&self) -> Option<&str> {
        match self {
            Binding::WorkflowInput { .. } => None,
            Binding::StepOutput { step } | Binding::ConditionalStepOutput { step, .. } => {
                Some(step)
            }
        }
    }
}

/// Serializable form of the built-in step policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum PolicyConfig {
    Retry {
        /// Total invocation budget; 0 means run once.
        #[serde(default)]
        max_retries: u32,
        /// Seconds to sleep between attempts.
        #[serde(default)]
        wait_secs: f64,
    },
    Timeout { seconds: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_serde_form() {
        let json = serde_json::to_value(Binding::workflow_input("x")).unwrap();
        assert_eq!(json, serde_json::json!({"source": "workflow_input", "key": "x"}));
        let json = serde_json::to_value(Binding::step_output("add")).unwrap();
        assert_eq!(json, serde_json::json!({"source": "step_output", "step": "add"}));
    }

    #[test]
    fn test_policy_serde_form() {
        let json = serde_json::to_value(PolicyConfig::Retry {
            max_retries: 3,
            wait_secs: 0.5,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"name": "retry", "max_retries": 3, "wait_secs": 0.5})
        );
    }

    #[test]
    fn test_join_mode_default_and_form() {
        assert_eq!(JoinMode::default(), JoinMode::And);
        assert_eq!(serde_json::to_string(&JoinMode::Or).unwrap(), "\"OR\"");
    }

    #[test]
    fn test_step_schema_edges() {
        let mut step = StepSchema::default();
        step.successors
            .insert("default".into(), vec!["b".into(), "c".into()]);
        step.successors.insert("skip".into(), vec!["d".into()]);
        let edges: Vec<_> = step.edges().collect();
        assert_eq!(edges, vec![("default", "b"), ("default", "c"), ("skip", "d")]);
    }

    #[test]
    fn test_timeout_lookup() {
        let mut step = StepSchema::default();
        assert_eq!(step.timeout_secs(), None);
        step.policies.push(PolicyConfig::Retry {
            max_retries: 1,
            wait_secs: 0.0,
        });
        step.policies.push(PolicyConfig::Timeout { seconds: 4.0 });
        assert_eq!(step.timeout_secs(), Some(4.0));
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::policy::StepPolicy;
use crate::schema::{Binding, JoinMode};

use super::handler::{Condition, StepHandler};

/// Declarative description of one step, consumed by
/// [`WorkflowBuilder`](super::WorkflowBuilder).
pub struct StepDef {
    pub(super) name: String,
    pub(super) class: String,
    pub(super) handler: Arc<dyn StepHandler>,
    pub(super) join_mode: JoinMode,
    pub(super) bindings: BTreeMap<String, Binding>,
    pub(super) conditions: Vec<(String, Condition)>,
    pub(super) policies: Vec<StepPolicy>,
    pub(super) max_retries: Option<u32>,
    pub(super) wait_secs: f64,
}

impl StepDef {
    /// A step whose class defaults to its name.
    pub fn new(name: impl Into<String>, handler: impl StepHandler + 'static) -> Self {
        let name = name.into();
        Self {
            class: name.clone(),
            name,
            handler: Arc::new(handler),
            join_mode: JoinMode::default(),
            bindings: BTreeMap::new(),
            conditions: Vec::new(),
            policies: Vec::new(),
            max_retries: None,
            wait_secs: 0.0,
        }
    }

    /// Override the handler class name used in the schema.
    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    /// Make the step ready as soon as any predecessor selects it.
    pub fn or_join(mut self) -> Self {
        self.join_mode = JoinMode::Or;
        self
    }

    /// Bind a parameter to an explicit source.
    pub fn bind(mut self, param: impl Into<String>, binding: Binding) -> Self {
        self.bindings.insert(param.into(), binding);
        self
    }

    /// Bind a parameter to a workflow input key.
    pub fn input(self, param: &str, key: &str) -> Self {
        self.bind(param, Binding::workflow_input(key))
    }

    /// Bind a parameter to another step's result. The edge is implied.
    pub fn depends_on(self, param: &str, step: &str) -> Self {
        self.bind(param, Binding::step_output(step))
    }

    /// Like [`StepDef::depends_on`], but a false condition on the resolved
    /// value skips this step instead of running it.
    pub fn depends_on_if<F>(mut self, param: &str, step: &str, condition_name: &str, f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.conditions
            .push((condition_name.to_string(), Arc::new(f)));
        self.bind(
            param,
            Binding::conditional_step_output(step, condition_name),
        )
    }

    /// Gate the whole step on the workflow inputs; a false gate sets the
    /// step `SKIPPED` at dispatch time.
    pub fn condition<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.conditions.push((name.into(), Arc::new(f)));
        self
    }

    pub fn policy(mut self, policy: StepPolicy) -> Self {
        self.policies.push(policy);
        self
    }

    /// Convenience for a retry policy: total invocation budget.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Seconds to sleep between retry attempts.
    pub fn wait(mut self, wait_secs: f64) -> Self {
        self.wait_secs = wait_secs;
        self
    }

    /// Convenience for a timeout policy.
    pub fn timeout(self, seconds: f64) -> Self {
        self.policy(StepPolicy::timeout(seconds))
    }

    pub(super) fn gate_names(&self) -> Vec<String> {
        // Conditions referenced by a binding are not dispatch-time gates.
        let bound: Vec<&str> = self
            .bindings
            .values()
            .filter_map(|b| match b {
                Binding::ConditionalStepOutput { condition, .. } => Some(condition.as_str()),
                _ => None,
            })
            .collect();
        self.conditions
            .iter()
            .map(|(name, _)| name.clone())
            .filter(|name| !bound.contains(&name.as_str()))
            .collect()
    }

    /// Effective policy list, with the retry convenience folded in.
    pub(super) fn effective_policies(&self) -> Vec<StepPolicy> {
        let mut policies = self.policies.clone();
        if let Some(max_retries) = self.max_retries {
            let has_retry = policies.iter().any(|p| matches!(p, StepPolicy::Retry(_)));
            if !has_retry {
                policies.insert(0, StepPolicy::retry(max_retries, self.wait_secs));
            }
        }
        policies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::FnStep;

    fn noop() -> FnStep {
        FnStep::from_sync(|_| Ok(Value::Null))
    }

    #[test]
    fn test_max_retries_folds_into_policy() {
        let def = StepDef::new("s", noop()).max_retries(3).wait(0.5);
        let policies = def.effective_policies();
        assert!(matches!(
            policies.as_slice(),
            [StepPolicy::Retry(p)] if p.max_retries == 3 && p.wait_secs == 0.5
        ));
    }

    #[test]
    fn test_explicit_retry_wins_over_convenience() {
        let def = StepDef::new("s", noop())
            .max_retries(3)
            .policy(StepPolicy::retry(7, 0.0));
        let policies = def.effective_policies();
        assert_eq!(policies.len(), 1);
        assert!(matches!(
            &policies[0],
            StepPolicy::Retry(p) if p.max_retries == 7
        ));
    }

    #[test]
    fn test_gate_names_exclude_binding_conditions() {
        let def = StepDef::new("s", noop())
            .condition("flag", |v| v.as_bool().unwrap_or(false))
            .depends_on_if("value", "up", "positive", |v| {
                v.as_f64().map(|f| f > 0.0).unwrap_or(false)
            });
        assert_eq!(def.gate_names(), vec!["flag"]);
        assert_eq!(
            def.bindings["value"],
            Binding::conditional_step_output("up", "positive")
        );
    }
}

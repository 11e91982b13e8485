//! Scripts ("matrices") and their per-step success tracking.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::action::{Action, ActionSpec, Params};
use crate::context::ContextStore;
use crate::variables::{SharedVariables, VariableStore};

/// Script as emitted by the script generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptSpec {
    pub name: String,

    #[serde(default)]
    pub actions: Vec<ActionSpec>,

    /// Named constants visible to formulas as `constants.<name>`.
    #[serde(default)]
    pub constants: Params,

    /// Errors reported while compiling the script.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    /// Errors prevent the run from starting.
    #[serde(default)]
    pub fatal: bool,
}

impl ScriptSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
            constants: Params::new(),
            errors: Vec::new(),
            fatal: false,
        }
    }

    pub fn with_action(mut self, action: ActionSpec) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_constant(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.constants.insert(name.into(), value.into());
        self
    }
}

/// A loaded script with its execution state.
#[derive(Debug)]
pub struct Script {
    pub name: String,
    pub actions: Vec<Action>,
    pub constants: Params,

    step_success: HashMap<String, bool>,
    step_comments: HashMap<String, Vec<String>>,
    executed: usize,
    successful: usize,

    context: Arc<ContextStore>,
    step_contexts: HashMap<String, Arc<ContextStore>>,
    variables: SharedVariables,
}

impl Script {
    /// Build a script from its generator output.
    pub fn from_spec(spec: ScriptSpec) -> Self {
        let actions = spec
            .actions
            .into_iter()
            .map(|a| Action::from_spec(spec.name.clone(), a))
            .collect();
        Self {
            variables: SharedVariables::new(VariableStore::with_constants(spec.constants.clone())),
            name: spec.name,
            actions,
            constants: spec.constants,
            step_success: HashMap::new(),
            step_comments: HashMap::new(),
            executed: 0,
            successful: 0,
            context: Arc::new(ContextStore::new()),
            step_contexts: HashMap::new(),
        }
    }

    /// Spec form of the current action list, used by snapshots.
    pub fn to_spec(&self) -> ScriptSpec {
        ScriptSpec {
            name: self.name.clone(),
            actions: self.actions.iter().map(Action::to_spec).collect(),
            constants: self.constants.clone(),
            errors: Vec::new(),
            fatal: false,
        }
    }

    /// Success of this script within `step`. Steps never touched count as successful.
    pub fn is_step_successful(&self, step: &str) -> bool {
        self.step_success.get(step).copied().unwrap_or(true)
    }

    /// Start tracking `step`, keeping an existing flag.
    pub(crate) fn enter_step(&mut self, step: &str) {
        self.step_success.entry(step.to_string()).or_insert(true);
    }

    /// Mark `step` as failed for this script.
    ///
    /// There is no way to mark a step successful again except
    /// [`Script::reset_step_for_replay`].
    pub fn set_step_failed(&mut self, step: &str, comment: impl Into<String>) {
        self.step_success.insert(step.to_string(), false);
        let comment = comment.into();
        let comments = self.step_comments.entry(step.to_string()).or_default();
        if !comments.contains(&comment) {
            comments.push(comment);
        }
    }

    /// Reset the success flag of `step` and clear finished markers of its actions.
    ///
    /// Returns false when the step was already successful and nothing changed.
    pub(crate) fn reset_step_for_replay(&mut self, step: &str) -> bool {
        if self.is_step_successful(step) {
            return false;
        }
        self.step_success.insert(step.to_string(), true);
        self.step_comments.remove(step);
        for action in self.actions.iter_mut().filter(|a| a.step_name == step) {
            action.done = false;
        }
        true
    }

    /// Restore a step flag from a snapshot.
    pub(crate) fn restore_step_success(&mut self, step: &str, successful: bool) {
        self.step_success.insert(step.to_string(), successful);
    }

    /// True iff every step this script took part in succeeded.
    pub fn is_successful(&self) -> bool {
        self.step_success.values().all(|ok| *ok)
    }

    pub fn step_success(&self) -> &HashMap<String, bool> {
        &self.step_success
    }

    pub fn step_comments(&self, step: &str) -> &[String] {
        self.step_comments.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Count one executed action.
    pub(crate) fn count_executed(&mut self, passed: bool) {
        self.executed += 1;
        if passed {
            self.successful += 1;
        }
    }

    /// Withdraw one success, e.g. when an async action finishes with failure.
    pub(crate) fn withdraw_success(&mut self) {
        self.successful = self.successful.saturating_sub(1);
    }

    /// Forget one counted execution before the action runs again.
    pub(crate) fn forget_execution(&mut self, passed: bool) {
        self.executed = self.executed.saturating_sub(1);
        if passed {
            self.successful = self.successful.saturating_sub(1);
        }
    }

    pub(crate) fn restore_counters(&mut self, executed: usize, successful: usize) {
        self.executed = executed;
        self.successful = successful.min(executed);
    }

    pub fn executed(&self) -> usize {
        self.executed
    }

    pub fn successful(&self) -> usize {
        self.successful
    }

    /// Script-scoped context.
    pub fn context(&self) -> Arc<ContextStore> {
        self.context.clone()
    }

    /// Step-scoped context of this script, created on first use.
    pub fn step_context(&mut self, step: &str) -> Arc<ContextStore> {
        self.step_contexts
            .entry(step.to_string())
            .or_insert_with(|| Arc::new(ContextStore::new()))
            .clone()
    }

    pub(crate) fn clear_step_context(&mut self, step: &str) {
        if let Some(ctx) = self.step_contexts.remove(step) {
            ctx.clear();
        }
    }

    pub fn variables(&self) -> &SharedVariables {
        &self.variables
    }

    /// Index of the first action of `step` that has not finished.
    pub fn first_pending_in_step(&self, step: &str) -> Option<usize> {
        self.actions
            .iter()
            .position(|a| a.step_name == step && !a.done)
    }
}

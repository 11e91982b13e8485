//! Action records produced by the script generator.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::result::ActionResult;

/// Ordered string parameters, as written in the script row.
pub type Params = IndexMap<String, String>;

/// Boolean attribute that is either fixed or computed by a formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagExpr {
    Value(bool),
    Formula(String),
}

impl FlagExpr {
    /// Constant value, if the flag does not need evaluation.
    pub fn constant(&self) -> Option<bool> {
        match self {
            FlagExpr::Value(v) => Some(*v),
            FlagExpr::Formula(_) => None,
        }
    }

    /// Formula text, if any.
    pub fn formula(&self) -> Option<&str> {
        match self {
            FlagExpr::Value(_) => None,
            FlagExpr::Formula(f) => Some(f.as_str()),
        }
    }
}

impl Default for FlagExpr {
    fn default() -> Self {
        FlagExpr::Value(false)
    }
}

impl From<bool> for FlagExpr {
    fn from(value: bool) -> Self {
        FlagExpr::Value(value)
    }
}

fn default_executable() -> FlagExpr {
    FlagExpr::Value(true)
}

/// When the completion of an async action must be awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitAsyncEnd {
    /// No explicit wait; the run end barrier still collects it.
    #[default]
    No,
    /// Wait at the end of the step the action belongs to.
    Step,
    /// Wait at the end of the run.
    Run,
}

/// Action as emitted by the script generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Identifier within the script; empty means unreferenceable.
    #[serde(default)]
    pub id: String,

    /// Action kind, selects the handler.
    #[serde(rename = "type")]
    pub action_type: String,

    /// Global step the action belongs to.
    pub step: String,

    #[serde(default)]
    pub params: Params,

    /// Parameter names repeated in the script row.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub duplicate_params: Vec<String>,

    #[serde(default = "default_executable")]
    pub executable: FlagExpr,

    #[serde(default)]
    pub inverted: FlagExpr,

    #[serde(rename = "async", default)]
    pub is_async: FlagExpr,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_group: Option<String>,

    #[serde(default)]
    pub wait_async_end: WaitAsyncEnd,

    /// Wait for the async action before this step starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_async_end_step: Option<String>,

    #[serde(default)]
    pub suspend_if_failed: FlagExpr,

    /// Delay before execution in milliseconds.
    #[serde(default)]
    pub timeout_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Script context keys removed once the action finishes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanable_contexts: Vec<String>,
}

impl ActionSpec {
    /// Create a spec with default flags.
    pub fn new(id: impl Into<String>, action_type: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action_type: action_type.into(),
            step: step.into(),
            params: Params::new(),
            duplicate_params: Vec::new(),
            executable: default_executable(),
            inverted: FlagExpr::default(),
            is_async: FlagExpr::default(),
            async_group: None,
            wait_async_end: WaitAsyncEnd::default(),
            wait_async_end_step: None,
            suspend_if_failed: FlagExpr::default(),
            timeout_ms: 0,
            comment: None,
            cleanable_contexts: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_async(mut self, is_async: impl Into<FlagExpr>) -> Self {
        self.is_async = is_async.into();
        self
    }

    pub fn with_inverted(mut self, inverted: impl Into<FlagExpr>) -> Self {
        self.inverted = inverted.into();
        self
    }

    pub fn with_executable(mut self, executable: impl Into<FlagExpr>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn with_wait_async_end(mut self, wait: WaitAsyncEnd) -> Self {
        self.wait_async_end = wait;
        self
    }

    pub fn with_async_group(mut self, group: impl Into<String>) -> Self {
        self.async_group = Some(group.into());
        self
    }

    pub fn with_suspend_if_failed(mut self, suspend: impl Into<FlagExpr>) -> Self {
        self.suspend_if_failed = suspend.into();
        self
    }
}

/// Flags after formula evaluation for the current execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFlags {
    pub executable: bool,
    pub inverted: bool,
    pub is_async: bool,
    pub suspend_if_failed: bool,
}

impl Default for ResolvedFlags {
    fn default() -> Self {
        Self {
            executable: true,
            inverted: false,
            is_async: false,
            suspend_if_failed: false,
        }
    }
}

/// One executable unit of a script.
#[derive(Debug, Clone)]
pub struct Action {
    /// Owning script.
    pub matrix_id: String,

    /// Identifier within the script; empty when unreferenceable.
    pub id_in_matrix: String,

    /// Globally unique identifier.
    pub unique_id: Uuid,

    pub action_type: String,
    pub step_name: String,
    pub input_params: Params,
    pub duplicate_params: Vec<String>,

    pub executable: FlagExpr,
    pub inverted: FlagExpr,
    pub is_async: FlagExpr,
    pub suspend_if_failed: FlagExpr,
    pub async_group: Option<String>,
    pub wait_async_end: WaitAsyncEnd,
    pub wait_async_end_step: Option<String>,
    pub timeout: Duration,
    pub comment: Option<String>,
    pub cleanable_contexts: Vec<String>,

    /// Inputs with formulas evaluated; set during execution.
    pub resolved_inputs: Option<Params>,

    /// Flags as evaluated for the current execution.
    pub flags: ResolvedFlags,

    /// Outputs produced by the action.
    pub output_params: Option<Params>,

    /// Outputs of nested sub-units, keyed by sub-unit id.
    pub sub_outputs: IndexMap<String, Params>,

    /// Action went through the dispatcher in the current pass.
    pub done: bool,

    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub result: Option<ActionResult>,
}

impl Action {
    /// Build an action from its generator output.
    pub fn from_spec(matrix_id: impl Into<String>, spec: ActionSpec) -> Self {
        Self {
            matrix_id: matrix_id.into(),
            id_in_matrix: spec.id,
            unique_id: Uuid::new_v4(),
            action_type: spec.action_type,
            step_name: spec.step,
            input_params: spec.params,
            duplicate_params: spec.duplicate_params,
            executable: spec.executable,
            inverted: spec.inverted,
            is_async: spec.is_async,
            suspend_if_failed: spec.suspend_if_failed,
            async_group: spec.async_group,
            wait_async_end: spec.wait_async_end,
            wait_async_end_step: spec.wait_async_end_step,
            timeout: Duration::from_millis(spec.timeout_ms),
            comment: spec.comment,
            cleanable_contexts: spec.cleanable_contexts,
            resolved_inputs: None,
            flags: ResolvedFlags::default(),
            output_params: None,
            sub_outputs: IndexMap::new(),
            done: false,
            started: None,
            finished: None,
            result: None,
        }
    }

    /// Spec form of this action, used for snapshots and updates.
    pub fn to_spec(&self) -> ActionSpec {
        ActionSpec {
            id: self.id_in_matrix.clone(),
            action_type: self.action_type.clone(),
            step: self.step_name.clone(),
            params: self.input_params.clone(),
            duplicate_params: self.duplicate_params.clone(),
            executable: self.executable.clone(),
            inverted: self.inverted.clone(),
            is_async: self.is_async.clone(),
            async_group: self.async_group.clone(),
            wait_async_end: self.wait_async_end,
            wait_async_end_step: self.wait_async_end_step.clone(),
            suspend_if_failed: self.suspend_if_failed.clone(),
            timeout_ms: self.timeout.as_millis() as u64,
            comment: self.comment.clone(),
            cleanable_contexts: self.cleanable_contexts.clone(),
        }
    }

    /// Identifier for logs: id in script, or the unique id if empty.
    pub fn display_id(&self) -> String {
        if self.id_in_matrix.is_empty() {
            self.unique_id.to_string()
        } else {
            self.id_in_matrix.clone()
        }
    }

    /// Key under which this action triggers variable cleanup.
    pub fn cleanup_key(&self) -> String {
        self.display_id()
    }

    /// Returns true if other actions can reference this one.
    pub fn is_referenceable(&self) -> bool {
        !self.id_in_matrix.is_empty()
    }

    /// Effective outcome of the last execution.
    pub fn is_passed(&self) -> bool {
        self.result.as_ref().map(|r| r.is_success()).unwrap_or(false)
    }

    /// Returns true if a formula decides whether this action runs asynchronously.
    pub fn may_be_async(&self) -> bool {
        !matches!(self.is_async, FlagExpr::Value(false))
    }

    /// Forget the outcome of the previous execution.
    pub fn reset_execution(&mut self) {
        self.done = false;
        self.started = None;
        self.finished = None;
        self.result = None;
        self.resolved_inputs = None;
        self.output_params = None;
        self.sub_outputs.clear();
        self.flags = ResolvedFlags::default();
    }

    /// Release transient data that is no longer needed.
    ///
    /// Published variables live in the variable store, so outputs held
    /// here are only needed until the report is written.
    pub fn dispose(&mut self, keep_details: bool) {
        self.resolved_inputs = None;
        self.output_params = None;
        self.sub_outputs.clear();
        if !keep_details {
            if let Some(result) = self.result.as_mut() {
                result.details = None;
            }
        }
    }
}

//! Action handler registry and dispatch contract.

use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::record::{Action, Params, WaitAsyncEnd};
use super::result::ActionResult;
use crate::context::ExecutionScope;
use crate::engine::JoinScope;
use crate::error::ActionError;

/// Everything a handler needs to execute one action.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    /// Owning script.
    pub script: String,

    /// Action id for logs (id in script or unique id).
    pub action_id: String,

    pub action_type: String,
    pub step: String,

    /// Inputs with formulas evaluated.
    pub params: Params,

    /// Configured delay; only meaningful to handlers managing their own timing.
    pub timeout: Duration,

    /// Action runs detached from the step loop.
    pub is_async: bool,

    /// Run cancellation token; check before long operations.
    pub cancel: CancellationToken,
}

impl ActionRequest {
    /// Get a parameter value.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|s| s.as_str())
    }

    /// Get a mandatory parameter value.
    pub fn require(&self, name: &str) -> Result<&str, ActionError> {
        self.param(name)
            .ok_or_else(|| ActionError::Execution(format!("Missing mandatory parameter '{}'", name)))
    }

    /// Fail with [`ActionError::Cancelled`] if the run was interrupted.
    pub fn check_cancelled(&self) -> Result<(), ActionError> {
        if self.cancel.is_cancelled() {
            Err(ActionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What a handler produced.
#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    pub result: ActionResult,
    pub outputs: Params,
    pub sub_outputs: IndexMap<String, Params>,
}

impl ActionOutcome {
    /// Create a passed outcome without outputs.
    pub fn passed() -> Self {
        Self::from_result(ActionResult::passed())
    }

    /// Create a failed outcome with comment.
    pub fn failed(comment: impl Into<String>) -> Self {
        Self::from_result(ActionResult::failed(comment))
    }

    pub fn from_result(result: ActionResult) -> Self {
        Self {
            result,
            outputs: Params::new(),
            sub_outputs: IndexMap::new(),
        }
    }

    /// Add an output parameter.
    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), value.into());
        self
    }

    /// Add outputs of a nested sub-unit.
    pub fn with_sub_output(mut self, sub_id: impl Into<String>, params: Params) -> Self {
        self.sub_outputs.insert(sub_id.into(), params);
        self
    }
}

/// Join scopes derived from the action's wait attributes.
pub fn default_join_scopes(action: &Action) -> Vec<JoinScope> {
    if let Some(step) = &action.wait_async_end_step {
        return vec![JoinScope::BeforeStep(step.clone())];
    }
    match action.wait_async_end {
        WaitAsyncEnd::Step => vec![JoinScope::StepEnd(action.step_name.clone())],
        WaitAsyncEnd::Run | WaitAsyncEnd::No => vec![JoinScope::RunEnd],
    }
}

/// Capability interface implemented by every action kind.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Returns the action type this handler serves.
    fn name(&self) -> &'static str;

    /// Execute the action.
    async fn execute(
        &self,
        request: &ActionRequest,
        scope: &ExecutionScope,
    ) -> Result<ActionOutcome, ActionError>;

    /// Failed actions of this kind are executed again on step replay.
    fn is_replayable(&self) -> bool {
        false
    }

    /// Barriers at which a detached action of this kind is awaited.
    fn join_scopes(&self, action: &Action) -> Vec<JoinScope> {
        default_join_scopes(action)
    }

    /// Handler applies the configured timeout itself.
    fn manages_timeout(&self) -> bool {
        false
    }

    /// Pacing or pause actions that always run inline, even when async.
    fn is_pseudo(&self) -> bool {
        false
    }

    /// Description for suspending the step after this action, if it pauses.
    fn pause_description(&self, _request: &ActionRequest) -> Option<String> {
        None
    }

    /// Pre-execution check; a returned result replaces execution.
    fn check(&self, _request: &ActionRequest, _scope: &ExecutionScope) -> Option<ActionResult> {
        None
    }

    /// Release resources before the operator decides on a failover.
    async fn on_failover(&self, _request: &ActionRequest, _scope: &ExecutionScope) {}
}

/// Registry of available action handlers.
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under its own name.
    pub fn register<H: ActionHandler + 'static>(&mut self, handler: H) {
        let name = handler.name().to_string();
        self.handlers.insert(name, Arc::new(handler));
    }

    /// Register a shared handler under an explicit type name.
    pub fn register_as(&mut self, action_type: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action_type.into(), handler);
    }

    /// Get a handler by action type.
    pub fn get(&self, action_type: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action_type).cloned()
    }

    /// Check if a handler is registered.
    pub fn has(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }

    /// List all registered action types.
    pub fn list(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

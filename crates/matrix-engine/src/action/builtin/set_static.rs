//! Static value publisher.

use async_trait::async_trait;

use crate::action::registry::{ActionHandler, ActionOutcome, ActionRequest};
use crate::context::ExecutionScope;
use crate::error::ActionError;

/// Copies every input parameter to the outputs.
///
/// Used to compute values once and reference them from later actions.
pub struct SetStaticAction;

impl SetStaticAction {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SetStaticAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionHandler for SetStaticAction {
    fn name(&self) -> &'static str {
        "SetStatic"
    }

    async fn execute(
        &self,
        request: &ActionRequest,
        _scope: &ExecutionScope,
    ) -> Result<ActionOutcome, ActionError> {
        let mut outcome = ActionOutcome::passed();
        outcome.outputs = request.params.clone();
        tracing::debug!(
            action_id = %request.action_id,
            outputs = outcome.outputs.len(),
            "Static values set"
        );
        Ok(outcome)
    }
}

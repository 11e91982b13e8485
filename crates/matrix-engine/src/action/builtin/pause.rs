//! Pause pseudo-action.

use async_trait::async_trait;

use crate::action::registry::{ActionHandler, ActionOutcome, ActionRequest};
use crate::context::ExecutionScope;
use crate::error::ActionError;

/// Suspends the step after it passes, until the operator continues.
///
/// `Description` is shown to the operator while the step is suspended.
pub struct PauseAction;

impl PauseAction {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PauseAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionHandler for PauseAction {
    fn name(&self) -> &'static str {
        "Pause"
    }

    async fn execute(
        &self,
        _request: &ActionRequest,
        _scope: &ExecutionScope,
    ) -> Result<ActionOutcome, ActionError> {
        Ok(ActionOutcome::passed())
    }

    fn is_pseudo(&self) -> bool {
        true
    }

    fn pause_description(&self, request: &ActionRequest) -> Option<String> {
        Some(
            request
                .param("Description")
                .map(str::to_string)
                .unwrap_or_else(|| format!("Paused by action '{}'", request.action_id)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Params;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_pause_description() {
        let mut request = ActionRequest {
            script: "m1".to_string(),
            action_id: "p1".to_string(),
            action_type: "Pause".to_string(),
            step: "Step1".to_string(),
            params: Params::new(),
            timeout: Duration::ZERO,
            is_async: true,
            cancel: CancellationToken::new(),
        };
        let action = PauseAction::new();
        assert!(action.is_pseudo());
        assert_eq!(
            action.pause_description(&request).as_deref(),
            Some("Paused by action 'p1'")
        );

        request
            .params
            .insert("Description".to_string(), "Check the GUI".to_string());
        assert_eq!(
            action.pause_description(&request).as_deref(),
            Some("Check the GUI")
        );
    }
}

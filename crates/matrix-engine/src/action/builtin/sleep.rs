//! Pacing action.

use async_trait::async_trait;
use std::time::Duration;

use crate::action::registry::{ActionHandler, ActionOutcome, ActionRequest};
use crate::context::ExecutionScope;
use crate::error::ActionError;

/// Waits for `Millis` (or the action timeout) before passing.
///
/// The wait ends early when the run is interrupted.
pub struct SleepAction;

impl SleepAction {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SleepAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionHandler for SleepAction {
    fn name(&self) -> &'static str {
        "Sleep"
    }

    async fn execute(
        &self,
        request: &ActionRequest,
        _scope: &ExecutionScope,
    ) -> Result<ActionOutcome, ActionError> {
        let duration = match request.param("Millis") {
            Some(ms) => Duration::from_millis(ms.trim().parse().map_err(|_| {
                ActionError::Execution(format!("Invalid value of 'Millis': '{}'", ms))
            })?),
            None => request.timeout,
        };

        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(ActionOutcome::passed()),
            _ = request.cancel.cancelled() => Err(ActionError::Cancelled),
        }
    }

    fn manages_timeout(&self) -> bool {
        true
    }

    fn is_pseudo(&self) -> bool {
        true
    }
}

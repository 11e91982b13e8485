//! Value comparison.

use async_trait::async_trait;

use crate::action::registry::{ActionHandler, ActionOutcome, ActionRequest};
use crate::action::ActionResult;
use crate::context::ExecutionScope;
use crate::error::ActionError;

/// Passes when `Expected` equals `Actual`.
///
/// Comparison is exact unless `IgnoreCase` is `true`. Verifiers are safe to
/// repeat, so failed comparisons are executed again on step replay.
pub struct CompareAction;

impl CompareAction {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CompareAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionHandler for CompareAction {
    fn name(&self) -> &'static str {
        "Compare"
    }

    async fn execute(
        &self,
        request: &ActionRequest,
        _scope: &ExecutionScope,
    ) -> Result<ActionOutcome, ActionError> {
        let expected = request.require("Expected")?;
        let actual = request.require("Actual")?;
        let ignore_case = request
            .param("IgnoreCase")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let matches = if ignore_case {
            expected.to_lowercase() == actual.to_lowercase()
        } else {
            expected == actual
        };

        let result = if matches {
            ActionResult::passed().with_comment("Values are equal")
        } else {
            ActionResult::failed(format!(
                "Expected '{}' but got '{}'",
                expected, actual
            ))
        };
        Ok(ActionOutcome::from_result(result)
            .with_output("Expected", expected)
            .with_output("Actual", actual))
    }

    fn is_replayable(&self) -> bool {
        true
    }
}

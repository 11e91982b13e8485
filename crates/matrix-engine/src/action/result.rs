//! Action result types.

use serde::{Deserialize, Serialize};

/// Why an action did not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    /// Action passed.
    #[default]
    No,
    /// Action executed and failed.
    Failed,
    /// Parameters could not be calculated.
    Calculation,
    /// Action was not executed.
    NotExecuted,
    /// Action raised an unexpected error.
    Exception,
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::No => write!(f, "no"),
            Self::Failed => write!(f, "failed"),
            Self::Calculation => write!(f, "calculation"),
            Self::NotExecuted => write!(f, "not_executed"),
            Self::Exception => write!(f, "exception"),
        }
    }
}

impl From<&str> for FailReason {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "failed" | "fail" => Self::Failed,
            "calculation" | "calculation_failed" => Self::Calculation,
            "not_executed" => Self::NotExecuted,
            "exception" | "crashed" => Self::Exception,
            _ => Self::No,
        }
    }
}

/// Result of one action execution.
///
/// `success` is what the action itself reported. The effective outcome
/// is `success` XOR `inverted`, see [`ActionResult::is_success`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Raw outcome reported by the action.
    pub success: bool,

    /// Outcome is inverted by the action's `inverted` flag.
    #[serde(default)]
    pub inverted: bool,

    /// Human-readable comment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Error text, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Action crashed instead of failing normally.
    #[serde(default)]
    pub crashed: bool,

    /// Fail reason recorded by the engine or the action.
    #[serde(default)]
    pub fail_reason: FailReason,

    /// Action-specific details kept for reporting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ActionResult {
    /// Create a passed result.
    pub fn passed() -> Self {
        Self {
            success: true,
            inverted: false,
            comment: None,
            error: None,
            crashed: false,
            fail_reason: FailReason::No,
            details: None,
        }
    }

    /// Create a failed result with comment.
    pub fn failed(comment: impl Into<String>) -> Self {
        Self {
            success: false,
            comment: Some(comment.into()),
            fail_reason: FailReason::Failed,
            ..Self::passed()
        }
    }

    /// Create a result for parameters that could not be calculated.
    pub fn calculation_error(comment: impl Into<String>) -> Self {
        Self {
            fail_reason: FailReason::Calculation,
            ..Self::failed(comment)
        }
    }

    /// Create a result for an action that was skipped.
    pub fn not_executed(comment: impl Into<String>) -> Self {
        Self {
            fail_reason: FailReason::NotExecuted,
            ..Self::failed(comment)
        }
    }

    /// Create a crash result from an unexpected error.
    pub fn crashed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            crashed: true,
            error: Some(error.into()),
            fail_reason: FailReason::Exception,
            ..Self::passed()
        }
    }

    /// Set the comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Set report details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Apply the action's inversion flag.
    pub fn with_inverted(mut self, inverted: bool) -> Self {
        self.inverted = inverted;
        self
    }

    /// Effective outcome after inversion.
    ///
    /// Crashed and not-executed results never pass, even when inverted.
    pub fn is_success(&self) -> bool {
        if self.crashed || self.fail_reason == FailReason::NotExecuted {
            return false;
        }
        self.success != self.inverted
    }

    /// Returns true if the action was skipped rather than executed.
    pub fn is_not_executed(&self) -> bool {
        self.fail_reason == FailReason::NotExecuted
    }

    /// Effective fail reason after inversion.
    pub fn effective_fail_reason(&self) -> FailReason {
        if self.is_success() {
            FailReason::No
        } else if self.fail_reason == FailReason::No {
            FailReason::Failed
        } else {
            self.fail_reason
        }
    }

    /// Comment and error joined for status messages.
    pub fn message(&self) -> String {
        match (&self.comment, &self.error) {
            (Some(c), Some(e)) => format!("{}: {}", c, e),
            (Some(c), None) => c.clone(),
            (None, Some(e)) => e.clone(),
            (None, None) if self.inverted && self.success => {
                "Action passed but is expected to fail".to_string()
            }
            (None, None) => String::new(),
        }
    }
}

impl Default for ActionResult {
    fn default() -> Self {
        Self::passed()
    }
}

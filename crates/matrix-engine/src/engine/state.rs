//! Run state and status records exposed to controllers.

use serde::{Deserialize, Serialize};

use super::failover::FailoverStatus;
use super::suspension::SuspensionState;
use crate::step::ProgressCounts;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Pending,
    Running,
    /// Blocked on the operator: pause, step-end ask or action suspension.
    Suspended,
    /// Blocked on a failover decision.
    AwaitingFailover,
    Completed,
    Interrupted,
}

impl RunState {
    /// Returns true if the run will not change state anymore.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Interrupted)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::Running => write!(f, "running"),
            RunState::Suspended => write!(f, "suspended"),
            RunState::AwaitingFailover => write!(f, "awaiting_failover"),
            RunState::Completed => write!(f, "completed"),
            RunState::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl From<&str> for RunState {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "running" => RunState::Running,
            "suspended" => RunState::Suspended,
            "awaiting_failover" => RunState::AwaitingFailover,
            "completed" => RunState::Completed,
            "interrupted" => RunState::Interrupted,
            _ => RunState::Pending,
        }
    }
}

/// Progress of one global step.
#[derive(Debug, Clone, Serialize)]
pub struct StepStatus {
    pub name: String,
    pub total: usize,
    #[serde(flatten)]
    pub counts: ProgressCounts,
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub state: RunState,
    pub current_step: Option<String>,
    pub suspension: SuspensionState,
    pub failover: FailoverStatus,
    pub steps: Vec<StepStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_display_roundtrip() {
        for state in [
            RunState::Pending,
            RunState::Running,
            RunState::Suspended,
            RunState::AwaitingFailover,
            RunState::Completed,
            RunState::Interrupted,
        ] {
            assert_eq!(RunState::from(state.to_string().as_str()), state);
        }
        assert_eq!(RunState::from("unknown"), RunState::Pending);
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Interrupted.is_terminal());
        assert!(!RunState::AwaitingFailover.is_terminal());
    }
}

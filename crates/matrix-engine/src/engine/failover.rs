//! Failover handshake between the dispatcher and the operator.
//!
//! A resource failure moves the coordinator from idle to pending. The
//! dispatcher then blocks until the operator sets exactly one of restart or
//! skip. Setting both, or neither, keeps the failover pending.

use serde::Serialize;
use std::collections::BTreeSet;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{FailoverError, FailoverReason};

/// Shared failover record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailoverStatus {
    pub in_progress: bool,
    pub script: Option<String>,
    pub action_id: Option<String>,
    pub action_type: Option<String>,
    pub reason: Option<FailoverReason>,
    pub reason_text: Option<String>,
    pub resource: Option<String>,
    pub restart: bool,
    pub skip: bool,
    pub ignore_all: bool,
    pub ignored_resources: BTreeSet<String>,
}

impl FailoverStatus {
    /// Operator decision, if exactly one of restart and skip is set.
    pub fn decision(&self) -> Option<FailoverDecision> {
        match (self.restart, self.skip) {
            (true, false) => Some(FailoverDecision::Restart),
            (false, true) => Some(FailoverDecision::Skip),
            _ => None,
        }
    }

    fn ignores(&self, resource: &str) -> bool {
        self.ignore_all || self.ignored_resources.contains(resource)
    }

    fn reset_pending(&mut self) {
        self.in_progress = false;
        self.script = None;
        self.action_id = None;
        self.action_type = None;
        self.reason = None;
        self.reason_text = None;
        self.resource = None;
        self.restart = false;
        self.skip = false;
    }
}

/// Operator decision for a pending failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverDecision {
    Restart,
    Skip,
}

/// How a failover ended, as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverOutcome {
    /// Execute the action again from input resolution.
    Restart,
    /// Operator chose to skip; the action fails.
    Skip,
    /// Resource is ignored by policy; the action fails without a wait.
    Ignored,
    /// Run was interrupted while waiting.
    Interrupted,
}

/// Identity of the action whose resource failed.
#[derive(Debug, Clone)]
pub struct FailingAction {
    pub script: String,
    pub action_id: String,
    pub action_type: String,
}

/// Per-run failover state machine.
#[derive(Debug)]
pub struct FailoverCoordinator {
    state: watch::Sender<FailoverStatus>,
}

impl FailoverCoordinator {
    pub fn new(ignore_all: bool, ignored_resources: impl IntoIterator<Item = String>) -> Self {
        let (state, _) = watch::channel(FailoverStatus {
            ignore_all,
            ignored_resources: ignored_resources.into_iter().collect(),
            ..FailoverStatus::default()
        });
        Self { state }
    }

    pub fn status(&self) -> FailoverStatus {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FailoverStatus> {
        self.state.subscribe()
    }

    pub fn is_in_progress(&self) -> bool {
        self.state.borrow().in_progress
    }

    /// Returns true if failures of `resource` are skipped without asking.
    pub fn is_ignored(&self, resource: &str) -> bool {
        self.state.borrow().ignores(resource)
    }

    pub fn ignore_all(&self, ignore: bool) {
        self.state.send_modify(|s| s.ignore_all = ignore);
    }

    pub fn ignore_resource(&self, resource: impl Into<String>, ignore: bool) {
        let resource = resource.into();
        self.state.send_modify(|s| {
            if ignore {
                s.ignored_resources.insert(resource);
            } else {
                s.ignored_resources.remove(&resource);
            }
        });
    }

    /// Set the restart flag independently of skip.
    pub fn set_restart(&self, restart: bool) {
        self.state.send_modify(|s| s.restart = restart);
    }

    /// Set the skip flag independently of restart.
    pub fn set_skip(&self, skip: bool) {
        self.state.send_modify(|s| s.skip = skip);
    }

    /// Set exactly one decision flag.
    pub fn resolve(&self, decision: FailoverDecision) {
        self.state.send_modify(|s| {
            s.restart = decision == FailoverDecision::Restart;
            s.skip = decision == FailoverDecision::Skip;
        });
    }

    /// Record the failure and wait for the operator.
    pub async fn handle(
        &self,
        error: &FailoverError,
        action: &FailingAction,
        cancel: &CancellationToken,
    ) -> FailoverOutcome {
        let mut ignored = false;
        self.state.send_modify(|s| {
            if s.ignores(&error.resource) {
                ignored = true;
                return;
            }
            s.in_progress = true;
            s.script = Some(action.script.clone());
            s.action_id = Some(action.action_id.clone());
            s.action_type = Some(action.action_type.clone());
            s.reason = Some(error.reason);
            s.reason_text = Some(error.message.clone());
            s.resource = Some(error.resource.clone());
            s.restart = false;
            s.skip = false;
        });
        if ignored {
            tracing::info!(
                resource = %error.resource,
                action_id = %action.action_id,
                "Failover ignored by policy"
            );
            return FailoverOutcome::Ignored;
        }

        tracing::warn!(
            script = %action.script,
            action_id = %action.action_id,
            resource = %error.resource,
            reason = %error.reason,
            "Failover in progress, waiting for decision"
        );

        let mut rx = self.state.subscribe();
        let decision = tokio::select! {
            r = rx.wait_for(|s| s.decision().is_some()) => r.ok().and_then(|s| s.decision()),
            _ = cancel.cancelled() => None,
        };

        self.state.send_modify(FailoverStatus::reset_pending);

        match decision {
            Some(FailoverDecision::Restart) => {
                tracing::info!(action_id = %action.action_id, "Failover resolved: restart");
                FailoverOutcome::Restart
            }
            Some(FailoverDecision::Skip) => {
                tracing::info!(action_id = %action.action_id, "Failover resolved: skip");
                FailoverOutcome::Skip
            }
            None => FailoverOutcome::Interrupted,
        }
    }
}

impl Default for FailoverCoordinator {
    fn default() -> Self {
        Self::new(false, Vec::new())
    }
}

//! Control surface of a running run.

use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::driver::CompletedRun;
use super::failover::{FailoverCoordinator, FailoverDecision, FailoverStatus};
use super::state::{RunState, RunStatus, StepStatus};
use super::suspension::{Suspension, SuspensionState};
use crate::action::ActionSpec;
use crate::config::EngineConfig;
use crate::context::RunContext;
use crate::error::EngineError;
use crate::step::StepProgress;

/// State shared by the driver task and the run handle.
#[derive(Debug)]
pub(crate) struct RunControl {
    pub cancel: CancellationToken,
    pub suspension: Suspension,
    pub failover: FailoverCoordinator,
    pub run_context: Arc<RunContext>,
    state: watch::Sender<RunState>,
    current_step: Mutex<Option<String>>,
}

impl RunControl {
    pub fn new(config: &EngineConfig) -> Self {
        let (state, _) = watch::channel(RunState::Pending);
        Self {
            cancel: CancellationToken::new(),
            suspension: Suspension::new(),
            failover: FailoverCoordinator::new(
                config.failover_ignore_all,
                config.failover_ignored_resources.iter().cloned(),
            ),
            run_context: Arc::new(RunContext::new()),
            state,
            current_step: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    fn state_receiver(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub fn set_state(&self, state: RunState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Run state changed");
        }
    }

    pub fn current_step(&self) -> Option<String> {
        self.current_step
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_current_step(&self, step: Option<String>) {
        *self.current_step.lock().unwrap_or_else(|e| e.into_inner()) = step;
    }

    /// Interrupt the run and every registered run resource.
    pub fn interrupt(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("Interrupting run");
        }
        self.cancel.cancel();
        self.run_context.cancel_resources();
    }
}

/// Request to replace the not yet executed tail of a script.
pub(crate) struct ScriptUpdate {
    pub script: String,
    pub from_index: usize,
    pub actions: Vec<ActionSpec>,
    pub reply: oneshot::Sender<Result<(), EngineError>>,
}

/// Handle of a started run.
pub struct RunHandle {
    control: Arc<RunControl>,
    updates: mpsc::UnboundedSender<ScriptUpdate>,
    steps: Vec<(String, Arc<StepProgress>)>,
    task: JoinHandle<CompletedRun>,
}

impl RunHandle {
    pub(crate) fn new(
        control: Arc<RunControl>,
        updates: mpsc::UnboundedSender<ScriptUpdate>,
        steps: Vec<(String, Arc<StepProgress>)>,
        task: JoinHandle<CompletedRun>,
    ) -> Self {
        Self {
            control,
            updates,
            steps,
            task,
        }
    }

    /// Stop the run; every blocking wait returns.
    pub fn interrupt(&self) {
        self.control.interrupt();
    }

    /// Pause before the next action.
    pub fn pause(&self) {
        self.control.suspension.pause();
    }

    /// Resume after a pause or suspension, or skip a start-time wait.
    pub fn continue_execution(&self) {
        self.control.suspension.continue_execution();
    }

    /// Resume a suspended step and replay it.
    pub fn replay_step(&self) {
        self.control.suspension.replay_step();
    }

    pub fn resolve_failover(&self, decision: FailoverDecision) {
        self.control.failover.resolve(decision);
    }

    pub fn set_failover_restart(&self, restart: bool) {
        self.control.failover.set_restart(restart);
    }

    pub fn set_failover_skip(&self, skip: bool) {
        self.control.failover.set_skip(skip);
    }

    pub fn ignore_all_failovers(&self, ignore: bool) {
        self.control.failover.ignore_all(ignore);
    }

    pub fn ignore_failover_for(&self, resource: impl Into<String>, ignore: bool) {
        self.control.failover.ignore_resource(resource, ignore);
    }

    pub fn is_suspended(&self) -> bool {
        self.control.suspension.is_suspended()
    }

    pub fn current_step(&self) -> Option<String> {
        self.control.current_step()
    }

    pub fn state(&self) -> RunState {
        self.control.state()
    }

    pub fn failover_status(&self) -> FailoverStatus {
        self.control.failover.status()
    }

    /// Run-scoped context, e.g. to register shared resources.
    pub fn run_context(&self) -> Arc<RunContext> {
        self.control.run_context.clone()
    }

    pub fn status(&self) -> RunStatus {
        RunStatus {
            state: self.control.state(),
            current_step: self.control.current_step(),
            suspension: self.control.suspension.snapshot(),
            failover: self.control.failover.status(),
            steps: self
                .steps
                .iter()
                .map(|(name, progress)| StepStatus {
                    name: name.clone(),
                    total: progress.total(),
                    counts: progress.counts(),
                })
                .collect(),
        }
    }

    /// Wait until the run state satisfies `predicate`.
    pub async fn wait_for_state(&self, predicate: impl Fn(RunState) -> bool) -> RunState {
        let mut rx = self.control.state_receiver();
        let state = match rx.wait_for(|s| predicate(*s)).await {
            Ok(state) => *state,
            Err(_) => self.control.state(),
        };
        state
    }

    /// Wait until the driver blocks on the operator.
    ///
    /// Returns `None` if the run ends first.
    pub async fn wait_for_suspension(&self) -> Option<SuspensionState> {
        let mut rx = self.control.suspension.subscribe();
        let reached = tokio::select! {
            r = rx.wait_for(|s| s.suspended) => r.ok().map(|s| s.clone()),
            _ = self.wait_for_state(|s| s.is_terminal()) => None,
        };
        reached
    }

    /// Wait until a failover waits for a decision.
    ///
    /// Returns `None` if the run ends first.
    pub async fn wait_for_failover(&self) -> Option<FailoverStatus> {
        let mut rx = self.control.failover.subscribe();
        let reached = tokio::select! {
            r = rx.wait_for(|s| s.in_progress) => r.ok().map(|s| s.clone()),
            _ = self.wait_for_state(|s| s.is_terminal()) => None,
        };
        reached
    }

    /// Replace the actions of `script` from `from_index` on.
    ///
    /// Applied by the driver between two actions; every replaced action
    /// must still be pending.
    pub async fn update_script(
        &self,
        script: impl Into<String>,
        from_index: usize,
        actions: Vec<ActionSpec>,
    ) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.updates
            .send(ScriptUpdate {
                script: script.into(),
                from_index,
                actions,
                reply,
            })
            .map_err(|_| EngineError::RunNotActive)?;
        rx.await.map_err(|_| EngineError::RunNotActive)?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end.
    pub async fn join(self) -> Result<CompletedRun, EngineError> {
        Ok(self.task.await?)
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("state", &self.control.state())
            .field("current_step", &self.control.current_step())
            .finish()
    }
}

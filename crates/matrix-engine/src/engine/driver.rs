//! Run driver: walks the global steps in order.
//!
//! The driver owns every script and step of the run. It is moved into a
//! single tokio task; the control surface only reaches it through the
//! shared [`RunControl`] and the script update channel.

use chrono::{DateTime, Local, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::async_join::{AsyncCompletion, AsyncCoordinator, JoinScope};
use super::handle::{RunControl, ScriptUpdate};
use super::state::RunState;
use super::suspension::SuspendOutcome;
use crate::action::{Action, ActionRegistry, ActionSpec, FlagExpr};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::expr::ExpressionEvaluator;
use crate::report::ReportSink;
use crate::script::Script;
use crate::snapshot::{RunSnapshot, ScriptSnapshot};
use crate::step::{start_time, ActionKey, GlobalStep, StartReference};
use crate::variables::CleaningTableBuilder;

pub(super) const STEP_FAILED: &str = "One or more actions failed";
pub(super) const STEP_CRASHED: &str = "One or more actions CRASHED";

/// Outcome of one pass over a step's action list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum StepPass {
    Completed { needs_replay: bool },
    Interrupted,
}

/// Final state of a run, returned by [`crate::RunHandle::join`].
#[derive(Debug)]
pub struct CompletedRun {
    pub state: RunState,
    pub scripts: Vec<Script>,
    pub steps: Vec<GlobalStep>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    next_step: Option<usize>,
}

impl CompletedRun {
    /// True iff the run completed and every script passed every step.
    pub fn is_successful(&self) -> bool {
        self.state == RunState::Completed && self.scripts.iter().all(Script::is_successful)
    }

    pub fn script(&self, name: &str) -> Option<&Script> {
        self.scripts.iter().find(|s| s.name == name)
    }

    pub fn step(&self, name: &str) -> Option<&GlobalStep> {
        self.steps.iter().find(|s| s.name() == name)
    }

    /// Action by script name and id in script.
    pub fn action(&self, script: &str, action_id: &str) -> Option<&Action> {
        self.script(script)?
            .actions
            .iter()
            .find(|a| a.id_in_matrix == action_id)
    }

    pub fn executed(&self) -> usize {
        self.scripts.iter().map(Script::executed).sum()
    }

    pub fn successful(&self) -> usize {
        self.scripts.iter().map(Script::successful).sum()
    }

    /// State needed to resume this run where it stopped.
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            steps: self.steps.iter().map(|s| s.def.clone()).collect(),
            next_step: self
                .next_step
                .and_then(|i| self.steps.get(i))
                .map(|s| s.name().to_string()),
            scripts: self.scripts.iter().map(ScriptSnapshot::capture).collect(),
            saved_at: Utc::now(),
        }
    }
}

/// Rebuild the flattened action list of every step.
///
/// Actions are grouped by script, scripts in declared order.
pub(crate) fn assign_step_actions(steps: &mut [GlobalStep], scripts: &[Script]) {
    let index: HashMap<String, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name().to_string(), i))
        .collect();
    for step in steps.iter_mut() {
        step.actions.clear();
    }
    for (s, script) in scripts.iter().enumerate() {
        for (a, action) in script.actions.iter().enumerate() {
            if let Some(&i) = index.get(&action.step_name) {
                steps[i].actions.push(ActionKey::new(s, a));
            }
        }
    }
    for step in steps.iter() {
        step.progress.set_total(step.actions.len());
    }
}

/// Install the cleaning table of `script`, built over its execution order:
/// actions grouped by step in step order, declaration order within a step.
pub(crate) fn install_cleaning_table(
    evaluator: &dyn ExpressionEvaluator,
    script: &Script,
    steps: &[GlobalStep],
) {
    let position: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name(), i))
        .collect();
    let mut ordered: Vec<&Action> = script.actions.iter().collect();
    ordered.sort_by_key(|a| {
        position
            .get(a.step_name.as_str())
            .copied()
            .unwrap_or(usize::MAX)
    });
    let table = CleaningTableBuilder::new(evaluator).build(ordered);
    script.variables().lock().set_cleaning_table(table);
}

pub(crate) struct RunDriver {
    pub(super) scripts: Vec<Script>,
    pub(super) steps: Vec<GlobalStep>,
    pub(super) registry: Arc<ActionRegistry>,
    pub(super) evaluator: Arc<dyn ExpressionEvaluator>,
    pub(super) reports: Arc<dyn ReportSink>,
    pub(super) config: EngineConfig,
    pub(super) control: Arc<RunControl>,
    pub(super) async_actions: AsyncCoordinator,
    updates: mpsc::UnboundedReceiver<ScriptUpdate>,
    started: DateTime<Utc>,
    first_step_started: Option<DateTime<Utc>>,
    /// Index of the step being executed, or of the next one between steps.
    pub(super) current: usize,
    /// Operator asked for a replay while the step was running.
    pub(super) replay_pending: bool,
}

impl RunDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scripts: Vec<Script>,
        steps: Vec<GlobalStep>,
        registry: Arc<ActionRegistry>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        reports: Arc<dyn ReportSink>,
        config: EngineConfig,
        control: Arc<RunControl>,
        updates: mpsc::UnboundedReceiver<ScriptUpdate>,
        resume_from: usize,
    ) -> Self {
        let async_actions = AsyncCoordinator::new(
            config.max_async_workers,
            config.async_poll_interval(),
            control.cancel.clone(),
        );
        Self {
            scripts,
            steps,
            registry,
            evaluator,
            reports,
            config,
            control,
            async_actions,
            updates,
            started: Utc::now(),
            first_step_started: None,
            current: resume_from,
            replay_pending: false,
        }
    }

    pub(super) fn action(&self, key: ActionKey) -> &Action {
        &self.scripts[key.script].actions[key.index]
    }

    pub(super) fn action_mut(&mut self, key: ActionKey) -> &mut Action {
        &mut self.scripts[key.script].actions[key.index]
    }

    /// Execute the remaining steps and return the final state.
    pub async fn run(mut self) -> CompletedRun {
        self.control.set_state(RunState::Running);
        tracing::info!(
            steps = self.steps.len(),
            scripts = self.scripts.len(),
            resume_from = self.current,
            "Run started"
        );

        let mut interrupted = false;
        while self.current < self.steps.len() {
            self.apply_updates();
            if self.control.cancel.is_cancelled()
                || !self.wait_for_step_start().await
                || !self.run_global_step().await
            {
                interrupted = true;
                break;
            }
            self.current += 1;
        }

        if !interrupted {
            let completions = self.async_actions.join_scope(&JoinScope::RunEnd).await;
            self.apply_completions(completions);
            interrupted = self.control.cancel.is_cancelled();
        }
        let remaining = self.async_actions.shutdown().await;
        self.apply_completions(remaining);
        self.control.run_context.clear();
        self.control.set_current_step(None);
        let state = if interrupted {
            RunState::Interrupted
        } else {
            RunState::Completed
        };
        self.control.set_state(state);

        let executed: usize = self.scripts.iter().map(Script::executed).sum();
        let successful: usize = self.scripts.iter().map(Script::successful).sum();
        tracing::info!(state = %state, executed, successful, "Run finished");

        CompletedRun {
            state,
            next_step: (self.current < self.steps.len()).then_some(self.current),
            scripts: self.scripts,
            steps: self.steps,
            started: self.started,
            finished: Utc::now(),
        }
    }

    /// Wait for the configured start time of the current step.
    ///
    /// Returns false if the run was interrupted while waiting.
    async fn wait_for_step_start(&mut self) -> bool {
        let idx = self.current;
        let local = |t: DateTime<Utc>| t.with_timezone(&Local);
        let prev = idx.checked_sub(1).map(|i| &self.steps[i]);
        let reference = StartReference {
            run_started: local(self.started),
            first_step_started: self.first_step_started.map(local),
            prev_step_started: prev.and_then(|s| s.started).map(local),
            prev_step_finished: prev.and_then(|s| s.finished).map(local),
        };

        let now = Local::now();
        let target = match start_time(&self.steps[idx].def, &reference, now) {
            Ok(Some(target)) => target,
            Ok(None) => return true,
            Err(message) => {
                tracing::warn!(step = %self.steps[idx].name(), "{}", message);
                return true;
            }
        };

        let delay = (target - now).to_std().unwrap_or_default();
        tracing::info!(
            step = %self.steps[idx].name(),
            start_at = %target.format("%Y-%m-%d %H:%M:%S"),
            "Waiting for step start time"
        );
        self.control.set_current_step(Some(self.steps[idx].name().to_string()));
        self.control
            .suspension
            .wait_for_start(delay, &self.control.cancel)
            .await
    }

    /// Run the current step, including its replays and join barriers.
    ///
    /// Returns false if the run was interrupted.
    async fn run_global_step(&mut self) -> bool {
        let idx = self.current;
        let name = self.steps[idx].name().to_string();
        self.control.set_current_step(Some(name.clone()));

        let now = Utc::now();
        self.steps[idx].started = Some(now);
        self.first_step_started.get_or_insert(now);
        for key in self.steps[idx].actions.clone() {
            self.scripts[key.script].enter_step(&name);
        }
        if self.step_may_replay(idx) {
            let participants: HashSet<usize> =
                self.steps[idx].actions.iter().map(|k| k.script).collect();
            for script in participants {
                self.scripts[script].variables().lock().begin_replay_window();
            }
        }

        tracing::info!(step = %name, actions = self.steps[idx].actions.len(), "Step started");

        let completions = self
            .async_actions
            .join_scope(&JoinScope::BeforeStep(name.clone()))
            .await;
        self.apply_completions(completions);

        let mut replay = false;
        loop {
            match self.run_step(idx, replay).await {
                StepPass::Interrupted => {
                    self.finish_step(idx);
                    return false;
                }
                StepPass::Completed { needs_replay: true } => {
                    self.prepare_step_replay(idx);
                    replay = true;
                }
                StepPass::Completed { needs_replay: false } => break,
            }
        }
        if replay {
            self.release_step_records(idx);
        }

        let completions = self
            .async_actions
            .join_scope(&JoinScope::StepEnd(name.clone()))
            .await;
        self.apply_completions(completions);

        self.finish_step(idx);
        !self.control.cancel.is_cancelled()
    }

    /// True if step `idx` may suspend with a replay offer.
    fn step_may_replay(&self, idx: usize) -> bool {
        let step = &self.steps[idx];
        step.def.ask_if_failed
            || step.def.ask_for_continue
            || step
                .actions
                .iter()
                .any(|&key| self.action(key).suspend_if_failed != FlagExpr::Value(false))
    }

    /// Release records again after a replay.
    ///
    /// Records restored for the replay whose last referrer kept its
    /// earlier result are released here.
    fn release_step_records(&self, idx: usize) {
        for &key in &self.steps[idx].actions {
            let action = &self.scripts[key.script].actions[key.index];
            if !action.done || action.flags.is_async {
                continue;
            }
            let purged = self.scripts[key.script]
                .variables()
                .lock()
                .cleanup_after(&action.cleanup_key());
            if !purged.is_empty() {
                tracing::debug!(action_id = %action.display_id(), purged = ?purged, "Variables released after replay");
            }
        }
    }

    fn finish_step(&mut self, idx: usize) {
        let name = self.steps[idx].name().to_string();

        for script in &self.scripts {
            script.variables().lock().end_replay_window();
        }

        if let Err(e) = self
            .reports
            .finalize(&self.steps[idx].def, &self.config.reports_dir)
        {
            tracing::warn!(step = %name, error = %e, "Failed to finalize step report");
        }

        let participants: HashSet<usize> = self.steps[idx].actions.iter().map(|k| k.script).collect();
        for script in participants {
            self.scripts[script].clear_step_context(&name);
        }

        let counts = self.steps[idx].progress.counts();
        let step = &mut self.steps[idx];
        step.finished = Some(Utc::now());
        step.status_comment = Some(format!(
            "{} of {} actions successful",
            counts.successful, counts.done
        ));
        tracing::info!(
            step = %name,
            done = counts.done,
            successful = counts.successful,
            "Step finished"
        );
    }

    /// Block on the operator, keeping the run state in sync.
    pub(super) async fn suspend(&mut self, reason: String, replay_offered: bool) -> SuspendOutcome {
        self.control.set_state(RunState::Suspended);
        let outcome = self
            .control
            .suspension
            .suspend(reason, replay_offered, &self.control.cancel)
            .await;
        if outcome != SuspendOutcome::Interrupted {
            self.control.set_state(RunState::Running);
        }
        outcome
    }

    /// Replace optimistic results of finished async actions.
    pub(super) fn apply_completions(&mut self, completions: Vec<AsyncCompletion>) {
        for completion in completions {
            self.apply_completion(completion);
        }
    }

    fn apply_completion(&mut self, completion: AsyncCompletion) {
        let key = completion.key;
        let Some(action) = self.scripts[key.script].actions.get(key.index) else {
            tracing::warn!(script = key.script, index = key.index, "Completion for unknown action");
            return;
        };
        let step_name = action.step_name.clone();
        let step_idx = self.steps.iter().position(|s| s.name() == step_name);
        let step_safe_name = step_idx
            .map(|i| self.steps[i].def.safe_name())
            .unwrap_or_else(|| crate::step::safe_name(&step_name));
        let passed = completion.result.is_success();
        let crashed = completion.result.crashed;

        if !passed {
            let script = &mut self.scripts[key.script];
            script.withdraw_success();
            script.set_step_failed(&step_name, if crashed { STEP_CRASHED } else { STEP_FAILED });
            if let Some(i) = step_idx {
                self.steps[i].progress.withdraw_success();
            }
        }

        let keep_details = self.config.keep_result_details;
        let action = &mut self.scripts[key.script].actions[key.index];
        action.result = Some(completion.result);
        action.output_params = Some(completion.outputs);
        action.sub_outputs = completion.sub_outputs;
        action.finished = Some(completion.finished);

        if passed {
            tracing::info!(script = %action.matrix_id, action_id = %action.display_id(), "Async action passed");
        } else {
            tracing::warn!(script = %action.matrix_id, action_id = %action.display_id(), "Async action failed");
        }

        if let Err(e) = self
            .reports
            .write(action, &self.config.reports_dir, &step_safe_name)
        {
            tracing::warn!(action_id = %action.display_id(), error = %e, "Failed to write report");
        }
        action.dispose(keep_details);
    }

    /// Apply queued script updates. Only called between two actions.
    pub(super) fn apply_updates(&mut self) {
        while let Ok(update) = self.updates.try_recv() {
            let result = self.apply_update(&update.script, update.from_index, update.actions);
            match &result {
                Ok(()) => tracing::info!(script = %update.script, from_index = update.from_index, "Script updated"),
                Err(e) => tracing::warn!(script = %update.script, error = %e, "Script update rejected"),
            }
            let _ = update.reply.send(result);
        }
    }

    fn apply_update(
        &mut self,
        script_name: &str,
        from_index: usize,
        specs: Vec<ActionSpec>,
    ) -> Result<(), EngineError> {
        let reject = |msg: String| Err(EngineError::UpdateRejected(msg));

        let Some(s) = self.scripts.iter().position(|m| m.name == script_name) else {
            return reject(format!("unknown script '{}'", script_name));
        };
        let script = &self.scripts[s];
        if from_index > script.actions.len() {
            return reject(format!(
                "position {} is beyond the {} actions of script '{}'",
                from_index,
                script.actions.len(),
                script_name
            ));
        }
        if let Some(done) = script.actions[from_index..].iter().find(|a| a.done) {
            return reject(format!("action '{}' has already been executed", done.display_id()));
        }

        let mut ids: HashSet<&str> = script.actions[..from_index]
            .iter()
            .filter(|a| a.is_referenceable())
            .map(|a| a.id_in_matrix.as_str())
            .collect();
        for spec in &specs {
            match self.steps.iter().position(|st| st.name() == spec.step) {
                None => return reject(format!("unknown step '{}'", spec.step)),
                Some(i) if i < self.current => {
                    return reject(format!("step '{}' has already finished", spec.step))
                }
                Some(_) => {}
            }
            if !self.registry.has(&spec.action_type) {
                return reject(format!("unknown action type '{}'", spec.action_type));
            }
            if !spec.id.is_empty() && !ids.insert(spec.id.as_str()) {
                return reject(format!("duplicate action id '{}'", spec.id));
            }
        }

        let script = &mut self.scripts[s];
        script.actions.truncate(from_index);
        let name = script.name.clone();
        script
            .actions
            .extend(specs.into_iter().map(|spec| Action::from_spec(name.clone(), spec)));

        install_cleaning_table(self.evaluator.as_ref(), &self.scripts[s], &self.steps);
        assign_step_actions(&mut self.steps, &self.scripts);

        if let Some(step) = self.steps.get_mut(self.current) {
            let first_pending = step
                .actions
                .iter()
                .position(|k| !self.scripts[k.script].actions[k.index].done)
                .unwrap_or(step.actions.len());
            if first_pending < step.cursor {
                step.rewind_to(first_pending);
                self.recount_progress(self.current);
            }
        }
        Ok(())
    }

    /// Recount progress of the actions before the cursor.
    fn recount_progress(&mut self, idx: usize) {
        let step = &self.steps[idx];
        step.progress.reset();
        for key in &step.actions[..step.cursor] {
            let action = &self.scripts[key.script].actions[key.index];
            if let Some(result) = action.result.as_ref().filter(|r| !r.is_not_executed()) {
                step.progress.record(result.is_success());
            }
        }
    }
}

//! Step runner: one pass over the flattened action list of a step.

use std::collections::{BTreeMap, HashSet};

use super::driver::{RunDriver, StepPass, STEP_CRASHED, STEP_FAILED};
use super::state::RunState;
use super::suspension::SuspendOutcome;
use crate::step::ActionKey;

impl RunDriver {
    /// Execute the pending actions of step `idx` in order.
    ///
    /// On a replay pass, finished actions are only re-executed when they
    /// failed and their handler is replayable.
    pub(super) async fn run_step(&mut self, idx: usize, replay: bool) -> StepPass {
        {
            let step = &mut self.steps[idx];
            step.progress.reset();
            step.cursor = 0;
        }
        self.replay_pending = false;
        let cancel = self.control.cancel.clone();
        if replay {
            tracing::info!(step = %self.steps[idx].name(), "Replaying step");
        }

        loop {
            self.apply_updates();
            if cancel.is_cancelled() {
                return StepPass::Interrupted;
            }

            let step = &self.steps[idx];
            let Some(&key) = step.actions.get(step.cursor) else {
                break;
            };

            if self.action(key).done {
                self.count_finished(idx, key);
                self.steps[idx].cursor += 1;
                continue;
            }

            if self.control.suspension.is_paused() {
                self.control.set_state(RunState::Suspended);
                if !self.control.suspension.wait_while_paused(&cancel).await {
                    return StepPass::Interrupted;
                }
                self.control.set_state(RunState::Running);
                continue;
            }

            if replay && !self.prepare_action_replay(idx, key) {
                self.steps[idx].cursor += 1;
                continue;
            }

            self.execute_action(idx, key).await;
            let completions = self.async_actions.poll_finished();
            self.apply_completions(completions);
            self.steps[idx].cursor += 1;

            if self.replay_pending {
                return StepPass::Completed { needs_replay: true };
            }
        }

        self.ask_at_step_end(idx).await
    }

    /// Count an action that finished in an earlier pass.
    fn count_finished(&mut self, idx: usize, key: ActionKey) {
        let Some(result) = self
            .action(key)
            .result
            .as_ref()
            .filter(|r| !r.is_not_executed())
        else {
            return;
        };
        let passed = result.is_success();
        let crashed = result.crashed;
        self.steps[idx].progress.record(passed);
        if !passed {
            let step_name = self.steps[idx].name().to_string();
            self.scripts[key.script]
                .set_step_failed(&step_name, if crashed { STEP_CRASHED } else { STEP_FAILED });
        }
    }

    /// Decide whether a finished action runs again during a replay.
    ///
    /// Returns false when the previous result is kept.
    fn prepare_action_replay(&mut self, idx: usize, key: ActionKey) -> bool {
        let replayable = self
            .registry
            .get(&self.action(key).action_type)
            .is_some_and(|h| h.is_replayable());
        let action = self.action(key);
        let Some(result) = action.result.as_ref() else {
            return true;
        };

        if replayable && !action.is_passed() {
            let counted = !result.is_not_executed();
            let passed = result.is_success();
            tracing::info!(
                script = %action.matrix_id,
                action_id = %action.display_id(),
                "Replaying action"
            );
            if counted {
                self.scripts[key.script].forget_execution(passed);
            }
            self.action_mut(key).reset_execution();
            return true;
        }

        self.action_mut(key).done = true;
        self.count_finished(idx, key);
        false
    }

    /// Reset every script taking part in step `idx` for another pass.
    pub(super) fn prepare_step_replay(&mut self, idx: usize) {
        let name = self.steps[idx].name().to_string();
        let mut referrers: BTreeMap<usize, HashSet<String>> = BTreeMap::new();
        for &key in &self.steps[idx].actions {
            referrers
                .entry(key.script)
                .or_default()
                .insert(self.action(key).cleanup_key());
        }
        for (s, keys) in referrers {
            let script = &mut self.scripts[s];
            if script.reset_step_for_replay(&name) {
                tracing::debug!(script = %script.name, step = %name, "Script reset for replay");
            }
            let restored = script.variables().lock().restore_for_replay(&keys);
            if restored > 0 {
                tracing::debug!(script = %script.name, step = %name, restored, "Variables restored for replay");
            }
        }
    }

    /// True if a failed action of step `idx` can run again.
    fn replay_available(&self, idx: usize) -> bool {
        self.steps[idx].actions.iter().any(|&key| {
            let action = self.action(key);
            action.result.as_ref().is_some_and(|r| !r.is_success())
                && self
                    .registry
                    .get(&action.action_type)
                    .is_some_and(|h| h.is_replayable())
        })
    }

    async fn ask_at_step_end(&mut self, idx: usize) -> StepPass {
        let def = &self.steps[idx].def;
        let failed = self.steps[idx].progress.counts().has_failures();
        if !(def.ask_for_continue || (def.ask_if_failed && failed)) {
            return StepPass::Completed { needs_replay: false };
        }

        let name = def.name.clone();
        let reason = if failed {
            format!("Step '{}' finished with failed actions", name)
        } else {
            format!("Step '{}' finished", name)
        };
        let replay_offered = failed && self.replay_available(idx);
        match self.suspend(reason, replay_offered).await {
            SuspendOutcome::Interrupted => StepPass::Interrupted,
            SuspendOutcome::Replay => StepPass::Completed { needs_replay: true },
            SuspendOutcome::Continue => StepPass::Completed { needs_replay: false },
        }
    }
}

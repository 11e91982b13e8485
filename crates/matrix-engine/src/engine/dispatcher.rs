//! Action dispatcher: resolves, executes and records one action.

use chrono::Utc;
use futures::FutureExt;
use indexmap::IndexMap;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::async_join::AsyncJob;
use super::driver::{RunDriver, STEP_CRASHED, STEP_FAILED};
use super::failover::{FailingAction, FailoverOutcome};
use super::state::RunState;
use super::suspension::SuspendOutcome;
use crate::action::{
    ActionHandler, ActionOutcome, ActionRequest, ActionResult, FlagExpr, Params, ResolvedFlags,
};
use crate::context::ExecutionScope;
use crate::error::{ActionError, FailoverError};
use crate::step::ActionKey;

pub(crate) const INTERRUPTED: &str = "Execution has been interrupted.";
pub(crate) const ASYNC_STARTED: &str =
    "Action is executing asynchronously. Will wait for its completion";

/// How a handler call ended.
pub(crate) enum Invocation {
    /// Handler produced an outcome, passed or failed.
    Completed(ActionOutcome),
    /// External resource failed; needs the failover handshake.
    Failover(FailoverError),
    /// Cancelled or crashed; the result is final and never inverted.
    Aborted(ActionResult),
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Call a handler, turning errors and panics into results.
pub(crate) async fn invoke(
    handler: &dyn ActionHandler,
    request: &ActionRequest,
    scope: &ExecutionScope,
) -> Invocation {
    let call = AssertUnwindSafe(handler.execute(request, scope))
        .catch_unwind()
        .await;
    match call {
        Ok(Ok(outcome)) => Invocation::Completed(outcome),
        Ok(Err(ActionError::Execution(message))) => {
            Invocation::Completed(ActionOutcome::failed(message))
        }
        Ok(Err(ActionError::Failover(e))) => Invocation::Failover(e),
        Ok(Err(ActionError::Cancelled)) => Invocation::Aborted(ActionResult::failed(INTERRUPTED)),
        Ok(Err(ActionError::Other(e))) => {
            tracing::error!(action_id = %request.action_id, error = %e, "Action crashed");
            Invocation::Aborted(ActionResult::crashed(format!("{:#}", e)))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(action_id = %request.action_id, panic = %message, "Action panicked");
            Invocation::Aborted(ActionResult::crashed(message))
        }
    }
}

/// Raw outcome of one dispatch attempt, before bookkeeping.
struct Attempt {
    result: ActionResult,
    outputs: Option<Params>,
    sub_outputs: IndexMap<String, Params>,
    /// Result comes from the handler and is subject to inversion.
    from_handler: bool,
}

impl Attempt {
    fn handler(outcome: ActionOutcome) -> Self {
        Self {
            result: outcome.result,
            outputs: Some(outcome.outputs),
            sub_outputs: outcome.sub_outputs,
            from_handler: true,
        }
    }

    fn engine(result: ActionResult) -> Self {
        Self {
            result,
            outputs: None,
            sub_outputs: IndexMap::new(),
            from_handler: false,
        }
    }
}

impl RunDriver {
    /// Dispatch one action and record its result.
    ///
    /// A failover restart goes through input resolution again without
    /// moving the step cursor.
    pub(super) async fn execute_action(&mut self, step_idx: usize, key: ActionKey) {
        let Some(handler) = self.registry.get(&self.action(key).action_type) else {
            let message = format!("No handler for action type '{}'", self.action(key).action_type);
            self.record(step_idx, key, Attempt::engine(ActionResult::crashed(message)));
            return;
        };
        let cancel = self.control.cancel.clone();

        loop {
            if let Err(message) = self.resolve_action(key) {
                tracing::warn!(
                    script = %self.action(key).matrix_id,
                    action_id = %self.action(key).display_id(),
                    "{}",
                    message
                );
                let attempt = Attempt::engine(ActionResult::calculation_error(message));
                self.record(step_idx, key, attempt);
                return;
            }

            let step_executes = self.steps[step_idx].def.execute;
            if !step_executes || !self.action(key).flags.executable {
                let comment = if step_executes {
                    "Action is not executable"
                } else {
                    "Step is not executed"
                };
                let attempt = Attempt::engine(ActionResult::not_executed(comment));
                self.record(step_idx, key, attempt);
                return;
            }

            let request = self.build_request(step_idx, key);
            let scope = self.execution_scope(step_idx, key);

            if let Some(result) = handler.check(&request, &scope) {
                self.record(step_idx, key, Attempt::engine(result));
                self.after_result(key, handler.as_ref(), &request).await;
                return;
            }

            if !handler.manages_timeout() && !request.timeout.is_zero() {
                let interrupted = tokio::select! {
                    _ = tokio::time::sleep(request.timeout) => false,
                    _ = cancel.cancelled() => true,
                };
                if interrupted {
                    let attempt = Attempt::engine(ActionResult::failed(INTERRUPTED));
                    self.record(step_idx, key, attempt);
                    return;
                }
            }

            if self.action(key).flags.is_async && !handler.is_pseudo() {
                self.detach_action(step_idx, key, handler.clone(), request, scope);
                return;
            }

            tracing::debug!(
                script = %request.script,
                action_id = %request.action_id,
                action_type = %request.action_type,
                "Executing action"
            );
            let attempt = match invoke(handler.as_ref(), &request, &scope).await {
                Invocation::Completed(outcome) => Attempt::handler(outcome),
                Invocation::Aborted(result) => Attempt::engine(result),
                Invocation::Failover(error) => {
                    match self.handle_failover(handler.as_ref(), &request, &scope, &error).await {
                        FailoverOutcome::Restart => {
                            tracing::info!(action_id = %request.action_id, "Restarting action after failover");
                            self.action_mut(key).reset_execution();
                            continue;
                        }
                        FailoverOutcome::Skip | FailoverOutcome::Ignored => {
                            Attempt::engine(ActionResult::failed(error.to_string()))
                        }
                        FailoverOutcome::Interrupted => {
                            Attempt::engine(ActionResult::failed(INTERRUPTED))
                        }
                    }
                }
            };
            self.record(step_idx, key, attempt);
            self.after_result(key, handler.as_ref(), &request).await;
            return;
        }
    }

    /// Evaluate inputs and flags, then publish the inputs.
    ///
    /// Returns the calculation error comment on failure.
    fn resolve_action(&mut self, key: ActionKey) -> Result<(), String> {
        let evaluator = self.evaluator.clone();
        let allow_duplicates = self.config.allow_duplicate_params;
        let script = &mut self.scripts[key.script];
        let variables = script.variables().clone();
        let action = &mut script.actions[key.index];
        let mut vars = variables.lock();

        action.started = Some(Utc::now());
        let mut resolved = Params::new();
        let mut unresolved: Vec<String> = Vec::new();
        for (name, raw) in &action.input_params {
            match evaluator.evaluate(raw, &vars, Some(&resolved)) {
                Ok(value) => {
                    resolved.insert(name.clone(), value);
                }
                Err(e) => {
                    tracing::debug!(action_id = %action.display_id(), param = %name, error = %e, "Parameter not calculated");
                    unresolved.push(name.clone());
                    resolved.insert(name.clone(), raw.clone());
                }
            }
        }

        let mut flag = |expr: &FlagExpr, name: &str, default: bool| {
            match evaluator.evaluate_flag(expr, &vars, Some(&resolved)) {
                Ok(value) => value,
                Err(e) => {
                    tracing::debug!(flag = %name, error = %e, "Flag not calculated");
                    unresolved.push(name.to_string());
                    default
                }
            }
        };
        let flags = ResolvedFlags {
            executable: flag(&action.executable, "executable", true),
            inverted: flag(&action.inverted, "inverted", false),
            is_async: flag(&action.is_async, "async", false),
            suspend_if_failed: flag(&action.suspend_if_failed, "suspendIfFailed", false),
        };

        vars.publish_inputs(&action.id_in_matrix, &resolved);
        drop(vars);
        action.resolved_inputs = Some(resolved);
        action.flags = flags;

        if !action.duplicate_params.is_empty() && !allow_duplicates {
            let names: Vec<String> = action
                .duplicate_params
                .iter()
                .map(|p| format!("'{}'", p))
                .collect();
            return Err(format!(
                "Duplicate parameters: {}. Check the action row in the script",
                names.join(", ")
            ));
        }
        if !unresolved.is_empty() {
            return Err(format!(
                "Could not calculate the following parameters: {}",
                unresolved.join(", ")
            ));
        }
        Ok(())
    }

    fn build_request(&self, step_idx: usize, key: ActionKey) -> ActionRequest {
        let action = self.action(key);
        ActionRequest {
            script: action.matrix_id.clone(),
            action_id: action.display_id(),
            action_type: action.action_type.clone(),
            step: self.steps[step_idx].name().to_string(),
            params: action.resolved_inputs.clone().unwrap_or_default(),
            timeout: action.timeout,
            is_async: action.flags.is_async,
            cancel: self.control.cancel.clone(),
        }
    }

    fn execution_scope(&mut self, step_idx: usize, key: ActionKey) -> ExecutionScope {
        let step = self.steps[step_idx].name().to_string();
        let script = &mut self.scripts[key.script];
        ExecutionScope::new(
            script.step_context(&step),
            script.context(),
            self.control.run_context.clone(),
        )
    }

    async fn handle_failover(
        &self,
        handler: &dyn ActionHandler,
        request: &ActionRequest,
        scope: &ExecutionScope,
        error: &FailoverError,
    ) -> FailoverOutcome {
        handler.on_failover(request, scope).await;
        let failing = FailingAction {
            script: request.script.clone(),
            action_id: request.action_id.clone(),
            action_type: request.action_type.clone(),
        };
        self.control.set_state(RunState::AwaitingFailover);
        let outcome = self
            .control
            .failover
            .handle(error, &failing, &self.control.cancel)
            .await;
        if outcome != FailoverOutcome::Interrupted {
            self.control.set_state(RunState::Running);
        }
        outcome
    }

    /// Apply a final result: counters, step flag, variables, report.
    fn record(&mut self, step_idx: usize, key: ActionKey, attempt: Attempt) {
        let step = &self.steps[step_idx];
        let step_name = step.name().to_string();
        let step_safe_name = step.def.safe_name();
        let progress = step.progress.clone();
        let keep_details = self.config.keep_result_details;

        let mut result = attempt.result;
        if attempt.from_handler {
            result = result.with_inverted(self.action(key).flags.inverted);
        }
        let passed = result.is_success();
        let counted = !result.is_not_executed();

        let script = &mut self.scripts[key.script];
        if counted {
            progress.record(passed);
            script.count_executed(passed);
            if !passed {
                script.set_step_failed(&step_name, if result.crashed { STEP_CRASHED } else { STEP_FAILED });
            }
        }

        let variables = script.variables().clone();
        let script_context = script.context();
        let action = &mut script.actions[key.index];
        action.finished = Some(Utc::now());
        action.done = true;
        action.output_params = attempt.outputs;
        action.sub_outputs = attempt.sub_outputs;

        if passed {
            tracing::info!(script = %action.matrix_id, action_id = %action.display_id(), "Action passed");
        } else {
            tracing::warn!(
                script = %action.matrix_id,
                action_id = %action.display_id(),
                fail_reason = %result.effective_fail_reason(),
                message = %result.message(),
                "Action failed"
            );
        }

        {
            let mut vars = variables.lock();
            vars.publish_result(
                &action.id_in_matrix,
                action.output_params.as_ref(),
                &action.sub_outputs,
                &result,
            );
            let purged = vars.cleanup_after(&action.cleanup_key());
            if !purged.is_empty() {
                tracing::debug!(action_id = %action.display_id(), purged = ?purged, "Variables released");
            }
        }
        action.result = Some(result);

        if let Err(e) = self
            .reports
            .write(action, &self.config.reports_dir, &step_safe_name)
        {
            tracing::warn!(action_id = %action.display_id(), error = %e, "Failed to write report");
        }
        for context_key in &action.cleanable_contexts {
            script_context.remove(context_key);
        }
        action.dispose(keep_details);
    }

    /// Hand the action to the async coordinator with an optimistic result.
    fn detach_action(
        &mut self,
        step_idx: usize,
        key: ActionKey,
        handler: Arc<dyn ActionHandler>,
        request: ActionRequest,
        scope: ExecutionScope,
    ) {
        let step = &self.steps[step_idx];
        let step_safe_name = step.def.safe_name();
        step.progress.record(true);

        let script = &mut self.scripts[key.script];
        script.count_executed(true);
        let variables = script.variables().clone();
        let action = &mut script.actions[key.index];
        let scopes = handler.join_scopes(action);

        let job = AsyncJob {
            key,
            variable_id: action.id_in_matrix.clone(),
            cleanup_key: action.cleanup_key(),
            cleanable_contexts: action.cleanable_contexts.clone(),
            group: action.async_group.clone(),
            request,
            handler,
            scope,
            variables,
            inverted: action.flags.inverted,
        };

        action.result = Some(ActionResult::passed().with_comment(ASYNC_STARTED));
        action.finished = Some(Utc::now());
        action.done = true;
        tracing::info!(
            script = %action.matrix_id,
            action_id = %action.display_id(),
            group = ?action.async_group,
            "{}",
            ASYNC_STARTED
        );
        if let Err(e) = self
            .reports
            .write(action, &self.config.reports_dir, &step_safe_name)
        {
            tracing::warn!(action_id = %action.display_id(), error = %e, "Failed to write report");
        }

        self.async_actions.detach(job, scopes);
    }

    /// Suspend after a failed action or a pause action.
    async fn after_result(&mut self, key: ActionKey, handler: &dyn ActionHandler, request: &ActionRequest) {
        let action = self.action(key);
        let reason = if action.flags.suspend_if_failed && !action.is_passed() {
            Some((
                format!("Action '{}' of script '{}' failed", action.display_id(), action.matrix_id),
                handler.is_replayable(),
            ))
        } else {
            handler.pause_description(request).map(|d| (d, false))
        };

        if let Some((reason, replay_offered)) = reason {
            if self.suspend(reason, replay_offered).await == SuspendOutcome::Replay {
                self.replay_pending = true;
            }
        }
    }
}

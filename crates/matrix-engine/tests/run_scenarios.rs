//! End-to-end runs through the public engine API.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use matrix_engine::engine::SuspensionState;
use matrix_engine::{
    create_default_registry, ActionError, ActionHandler, ActionOutcome, ActionRequest, ActionSpec,
    CompletedRun, Engine, EngineConfig, ExecutionScope, FailReason, FailoverDecision,
    FailoverError, FailoverReason, FailoverStatus, JsonFileSnapshotStore, MemoryReportSink,
    Params, RunHandle, RunPlan, RunState, ScriptSpec, SnapshotStore, StepDef, WaitAsyncEnd,
};

const WAIT: Duration = Duration::from_secs(5);

/// Test handler driven by its parameters.
///
/// - `FailTimes`: fail the first N attempts
/// - `FailoverTimes`: raise a resource failure on the first N attempts
/// - `DelayMs`: sleep before answering, honoring cancellation
#[derive(Default)]
struct Recorder {
    replayable: bool,
    calls: Mutex<HashMap<String, usize>>,
    seen: Mutex<HashMap<String, Params>>,
}

impl Recorder {
    fn new(replayable: bool) -> Arc<Self> {
        Arc::new(Self {
            replayable,
            ..Self::default()
        })
    }

    fn calls(&self, action_id: &str) -> usize {
        self.calls.lock().unwrap().get(action_id).copied().unwrap_or(0)
    }

    fn seen(&self, action_id: &str, param: &str) -> Option<String> {
        self.seen
            .lock()
            .unwrap()
            .get(action_id)
            .and_then(|p| p.get(param).cloned())
    }
}

#[async_trait]
impl ActionHandler for Recorder {
    fn name(&self) -> &'static str {
        "Recorder"
    }

    async fn execute(
        &self,
        request: &ActionRequest,
        _scope: &ExecutionScope,
    ) -> Result<ActionOutcome, ActionError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(request.action_id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.seen
            .lock()
            .unwrap()
            .insert(request.action_id.clone(), request.params.clone());

        if let Some(ms) = request.param("DelayMs") {
            let delay = Duration::from_millis(ms.parse().unwrap());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = request.cancel.cancelled() => return Err(ActionError::Cancelled),
            }
        }

        let limit = |name: &str| {
            request
                .param(name)
                .map(|v| v.parse::<usize>().unwrap())
                .unwrap_or(0)
        };
        if attempt <= limit("FailoverTimes") {
            return Err(FailoverError::new(
                "broker",
                FailoverReason::ConnectionError,
                "connection refused",
            )
            .into());
        }
        if attempt <= limit("FailTimes") {
            return Ok(ActionOutcome::failed(format!("attempt {} failed", attempt)));
        }
        Ok(ActionOutcome::passed().with_output("Attempt", attempt.to_string()))
    }

    fn is_replayable(&self) -> bool {
        self.replayable
    }
}

fn config() -> EngineConfig {
    EngineConfig::default().with_async_poll_interval(Duration::from_millis(10))
}

fn engine_with(recorder: &Arc<Recorder>, config: EngineConfig) -> Engine {
    let mut registry = create_default_registry();
    registry.register_as("Recorder", recorder.clone());
    Engine::new(config).with_registry(registry)
}

fn engine(recorder: &Arc<Recorder>) -> Engine {
    engine_with(recorder, config())
}

async fn finish(handle: RunHandle) -> CompletedRun {
    tokio::time::timeout(WAIT, handle.join())
        .await
        .expect("run did not finish in time")
        .unwrap()
}

async fn suspended(handle: &RunHandle) -> SuspensionState {
    tokio::time::timeout(WAIT, handle.wait_for_suspension())
        .await
        .expect("run did not suspend in time")
        .expect("run ended before suspending")
}

async fn failover(handle: &RunHandle) -> FailoverStatus {
    tokio::time::timeout(WAIT, handle.wait_for_failover())
        .await
        .expect("no failover in time")
        .expect("run ended before failover")
}

#[tokio::test]
async fn test_replay_reruns_only_failed_replayable_action() {
    let recorder = Recorder::new(true);
    let plan = RunPlan::new(vec![StepDef::new("Step1").with_ask_if_failed(true)]).with_script(
        ScriptSpec::new("m1")
            .with_action(ActionSpec::new("a1", "Recorder", "Step1"))
            .with_action(ActionSpec::new("a2", "Recorder", "Step1").with_param("FailTimes", "1"))
            .with_action(ActionSpec::new("a3", "Recorder", "Step1")),
    );

    let handle = engine(&recorder).start(plan).unwrap();
    let suspension = suspended(&handle).await;
    assert!(suspension.replay_offered);
    assert_eq!(handle.state(), RunState::Suspended);
    let status = handle.status();
    assert_eq!(status.steps[0].counts.done, 3);
    assert_eq!(status.steps[0].counts.successful, 2);

    handle.replay_step();
    let run = finish(handle).await;

    assert_eq!(recorder.calls("a1"), 1);
    assert_eq!(recorder.calls("a2"), 2);
    assert_eq!(recorder.calls("a3"), 1);
    assert!(run.is_successful());
    assert_eq!(run.executed(), 3);
    assert_eq!(run.successful(), 3);
    let counts = run.step("Step1").unwrap().progress.counts();
    assert_eq!((counts.done, counts.successful), (3, 3));
}

#[tokio::test]
async fn test_step_end_ask_without_replayable_failure() {
    let recorder = Recorder::new(false);
    let plan = RunPlan::new(vec![StepDef::new("Step1").with_ask_if_failed(true)]).with_script(
        ScriptSpec::new("m1")
            .with_action(ActionSpec::new("a1", "Recorder", "Step1").with_param("FailTimes", "1")),
    );

    let handle = engine(&recorder).start(plan).unwrap();
    let suspension = suspended(&handle).await;
    assert!(!suspension.replay_offered);
    assert!(suspension.reason.unwrap().contains("Step1"));

    handle.continue_execution();
    let run = finish(handle).await;

    assert_eq!(run.state, RunState::Completed);
    assert!(!run.is_successful());
    assert_eq!(recorder.calls("a1"), 1);
    assert_eq!(
        run.script("m1").unwrap().step_comments("Step1"),
        ["One or more actions failed".to_string()]
    );
}

#[tokio::test]
async fn test_ask_for_continue_after_successful_step() {
    let recorder = Recorder::new(true);
    let plan = RunPlan::new(vec![
        StepDef::new("Step1").with_ask_for_continue(true),
        StepDef::new("Step2"),
    ])
    .with_script(
        ScriptSpec::new("m1")
            .with_action(ActionSpec::new("a1", "Recorder", "Step1"))
            .with_action(ActionSpec::new("a2", "Recorder", "Step2")),
    );

    let handle = engine(&recorder).start(plan).unwrap();
    let suspension = suspended(&handle).await;
    assert!(!suspension.replay_offered);
    assert_eq!(handle.current_step().as_deref(), Some("Step1"));
    assert_eq!(recorder.calls("a2"), 0);

    handle.continue_execution();
    let run = finish(handle).await;
    assert!(run.is_successful());
    assert_eq!(recorder.calls("a2"), 1);
}

#[tokio::test]
async fn test_async_failure_withdraws_step_success() {
    let recorder = Recorder::new(false);
    let reports = Arc::new(MemoryReportSink::new());
    let plan = RunPlan::new(vec![StepDef::new("Step1")]).with_script(
        ScriptSpec::new("m1")
            .with_action(
                ActionSpec::new("a1", "Recorder", "Step1")
                    .with_async(true)
                    .with_wait_async_end(WaitAsyncEnd::Step)
                    .with_param("FailTimes", "1")
                    .with_param("DelayMs", "50"),
            )
            .with_action(ActionSpec::new("a2", "Recorder", "Step1")),
    );

    let handle = engine(&recorder)
        .with_report_sink(reports.clone())
        .start(plan)
        .unwrap();
    let run = finish(handle).await;

    let counts = run.step("Step1").unwrap().progress.counts();
    assert_eq!(counts.done, 2);
    assert_eq!(counts.successful, 1);

    let script = run.script("m1").unwrap();
    assert!(!script.is_step_successful("Step1"));
    assert_eq!(script.executed(), 2);
    assert_eq!(script.successful(), 1);

    let a1 = run.action("m1", "a1").unwrap();
    assert!(!a1.is_passed());
    assert_eq!(a1.result.as_ref().unwrap().comment.as_deref(), Some("attempt 1 failed"));
    assert!(!reports.entry("m1", "a1").unwrap().passed());
    assert!(!run.is_successful());
}

#[tokio::test]
async fn test_async_action_waits_before_later_step() {
    let recorder = Recorder::new(false);
    let mut spec = ActionSpec::new("a1", "Recorder", "Step1")
        .with_async(true)
        .with_param("DelayMs", "50");
    spec.wait_async_end_step = Some("Step2".to_string());
    let plan = RunPlan::new(vec![StepDef::new("Step1"), StepDef::new("Step2")]).with_script(
        ScriptSpec::new("m1")
            .with_action(spec)
            .with_action(ActionSpec::new("a2", "SetStatic", "Step2").with_param("x", "@{a1.out.Attempt}")),
    );

    let run = finish(engine(&recorder).start(plan).unwrap()).await;

    assert!(run.is_successful());
    assert!(run.action("m1", "a1").unwrap().is_passed());
    assert!(run.action("m1", "a2").unwrap().is_passed());
}

#[tokio::test]
async fn test_failover_restart_resolves_inputs_again() {
    let recorder = Recorder::new(false);
    let plan = RunPlan::new(vec![StepDef::new("Step1")]).with_script(
        ScriptSpec::new("m1")
            .with_action(ActionSpec::new("a1", "SetStatic", "Step1").with_param("x", "42"))
            .with_action(
                ActionSpec::new("a2", "Recorder", "Step1")
                    .with_param("FailoverTimes", "1")
                    .with_param("Value", "@{a1.x}"),
            ),
    );

    let handle = engine(&recorder).start(plan).unwrap();
    let status = failover(&handle).await;
    assert_eq!(status.action_id.as_deref(), Some("a2"));
    assert_eq!(status.resource.as_deref(), Some("broker"));
    assert_eq!(status.reason, Some(FailoverReason::ConnectionError));
    assert_eq!(handle.state(), RunState::AwaitingFailover);

    handle.resolve_failover(FailoverDecision::Restart);
    let run = finish(handle).await;

    assert_eq!(recorder.calls("a2"), 2);
    assert_eq!(recorder.seen("a2", "Value").as_deref(), Some("42"));
    assert!(run.action("m1", "a2").unwrap().is_passed());
    assert!(run.is_successful());
    assert!(!run.scripts[0].variables().lock().contains("a1"));
}

#[tokio::test]
async fn test_failover_needs_exactly_one_decision() {
    let recorder = Recorder::new(false);
    let plan = RunPlan::new(vec![StepDef::new("Step1")]).with_script(
        ScriptSpec::new("m1")
            .with_action(ActionSpec::new("a1", "Recorder", "Step1").with_param("FailoverTimes", "1"))
            .with_action(ActionSpec::new("a2", "Recorder", "Step1")),
    );

    let handle = engine(&recorder).start(plan).unwrap();
    failover(&handle).await;

    handle.set_failover_restart(true);
    handle.set_failover_skip(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.failover_status().in_progress);
    assert_eq!(handle.state(), RunState::AwaitingFailover);
    assert_eq!(recorder.calls("a2"), 0);

    handle.set_failover_restart(false);
    let run = finish(handle).await;

    assert_eq!(recorder.calls("a1"), 1);
    assert_eq!(recorder.calls("a2"), 1);
    let a1 = run.action("m1", "a1").unwrap();
    assert!(!a1.is_passed());
    assert!(a1.result.as_ref().unwrap().message().contains("broker"));
    assert!(!run.is_successful());
}

#[tokio::test]
async fn test_ignored_resource_fails_without_waiting() {
    let recorder = Recorder::new(false);
    let mut config = config();
    config.failover_ignored_resources = vec!["broker".to_string()];
    let plan = RunPlan::new(vec![StepDef::new("Step1")]).with_script(
        ScriptSpec::new("m1")
            .with_action(ActionSpec::new("a1", "Recorder", "Step1").with_param("FailoverTimes", "1")),
    );

    let run = finish(engine_with(&recorder, config).start(plan).unwrap()).await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(recorder.calls("a1"), 1);
    assert!(!run.action("m1", "a1").unwrap().is_passed());
    assert_eq!(run.steps[0].progress.counts().successful, 0);
}

#[tokio::test]
async fn test_records_released_after_last_reference() {
    let recorder = Recorder::new(false);
    let plan = RunPlan::new(vec![StepDef::new("Step1"), StepDef::new("Step2")]).with_script(
        ScriptSpec::new("m1")
            .with_action(ActionSpec::new("a1", "SetStatic", "Step1").with_param("x", "5"))
            .with_action(ActionSpec::new("a2", "SetStatic", "Step1").with_param("y", "7"))
            .with_action(
                ActionSpec::new("c1", "Compare", "Step2")
                    .with_param("Expected", "5")
                    .with_param("Actual", "@{a1.x}"),
            )
            .with_action(ActionSpec::new("p1", "Recorder", "Step2").with_param("Sum", "@{a1.x}")),
    );

    let run = finish(engine(&recorder).start(plan).unwrap()).await;

    assert!(run.is_successful());
    assert_eq!(recorder.seen("p1", "Sum").as_deref(), Some("5"));
    assert!(run.scripts[0].variables().lock().is_empty());
}

#[tokio::test]
async fn test_records_follow_execution_order_not_declaration_order() {
    let plan = RunPlan::new(vec![StepDef::new("Step1"), StepDef::new("Step2")]).with_script(
        ScriptSpec::new("m1")
            .with_action(
                ActionSpec::new("x", "Compare", "Step2")
                    .with_param("Expected", "5")
                    .with_param("Actual", "@{a1.x}"),
            )
            .with_action(ActionSpec::new("a1", "SetStatic", "Step1").with_param("x", "5"))
            .with_action(
                ActionSpec::new("y", "Compare", "Step1")
                    .with_param("Expected", "5")
                    .with_param("Actual", "@{a1.x}"),
            ),
    );

    let run = finish(Engine::new(config()).start(plan).unwrap()).await;

    assert!(run.action("m1", "y").unwrap().is_passed());
    assert!(run.action("m1", "x").unwrap().is_passed());
    assert!(run.is_successful());
    assert!(run.scripts[0].variables().lock().is_empty());
}

#[tokio::test]
async fn test_replayed_action_still_resolves_released_records() {
    let recorder = Recorder::new(true);
    let plan = RunPlan::new(vec![StepDef::new("Step1").with_ask_if_failed(true)]).with_script(
        ScriptSpec::new("m1")
            .with_action(ActionSpec::new("a1", "SetStatic", "Step1").with_param("x", "5"))
            .with_action(
                ActionSpec::new("a2", "Recorder", "Step1")
                    .with_param("FailTimes", "1")
                    .with_param("V", "@{a1.x}"),
            )
            .with_action(ActionSpec::new("a3", "Recorder", "Step1").with_param("V", "@{a1.x}")),
    );

    let handle = engine(&recorder).start(plan).unwrap();
    let suspension = suspended(&handle).await;
    assert!(suspension.replay_offered);
    handle.replay_step();
    let run = finish(handle).await;

    assert_eq!(recorder.calls("a2"), 2);
    assert_eq!(recorder.calls("a3"), 1);
    assert_eq!(recorder.seen("a2", "V").as_deref(), Some("5"));
    assert!(run.action("m1", "a2").unwrap().is_passed());
    assert!(run.is_successful());
    assert!(run.scripts[0].variables().lock().is_empty());
}

#[tokio::test]
async fn test_step_failure_is_sticky_and_inversion_applies() {
    let plan = RunPlan::new(vec![StepDef::new("Step1")]).with_script(
        ScriptSpec::new("m1")
            .with_action(
                ActionSpec::new("c1", "Compare", "Step1")
                    .with_param("Expected", "1")
                    .with_param("Actual", "2"),
            )
            .with_action(
                ActionSpec::new("c2", "Compare", "Step1")
                    .with_param("Expected", "1")
                    .with_param("Actual", "2")
                    .with_inverted(true),
            )
            .with_action(
                ActionSpec::new("c3", "Compare", "Step1")
                    .with_param("Expected", "1")
                    .with_param("Actual", "1"),
            ),
    );

    let run = finish(Engine::new(config()).start(plan).unwrap()).await;

    assert_eq!(run.state, RunState::Completed);
    assert!(!run.action("m1", "c1").unwrap().is_passed());
    assert!(run.action("m1", "c2").unwrap().is_passed());
    assert!(run.action("m1", "c3").unwrap().is_passed());
    assert!(!run.script("m1").unwrap().is_step_successful("Step1"));
    assert!(!run.is_successful());
    let counts = run.steps[0].progress.counts();
    assert_eq!((counts.done, counts.successful), (3, 2));
}

#[tokio::test]
async fn test_unresolved_skipped_and_duplicate_parameters() {
    let mut duplicated = ActionSpec::new("a3", "SetStatic", "Step1").with_param("x", "1");
    duplicated.duplicate_params = vec!["x".to_string()];
    let plan = RunPlan::new(vec![StepDef::new("Step1"), StepDef::new("Step2").with_execute(false)])
        .with_script(
            ScriptSpec::new("m1")
                .with_action(ActionSpec::new("a1", "SetStatic", "Step1").with_param("x", "@{missing.value}"))
                .with_action(ActionSpec::new("a2", "SetStatic", "Step1").with_executable(false))
                .with_action(duplicated)
                .with_action(ActionSpec::new("a4", "SetStatic", "Step2")),
        );

    let run = finish(Engine::new(config()).start(plan).unwrap()).await;

    let a1 = run.action("m1", "a1").unwrap().result.clone().unwrap();
    assert_eq!(a1.fail_reason, FailReason::Calculation);
    assert_eq!(
        a1.comment.as_deref(),
        Some("Could not calculate the following parameters: x")
    );

    let a2 = run.action("m1", "a2").unwrap();
    assert!(a2.done);
    assert!(a2.result.as_ref().unwrap().is_not_executed());

    let a3 = run.action("m1", "a3").unwrap().result.clone().unwrap();
    assert_eq!(
        a3.comment.as_deref(),
        Some("Duplicate parameters: 'x'. Check the action row in the script")
    );

    assert!(run.action("m1", "a4").unwrap().result.as_ref().unwrap().is_not_executed());

    let counts = run.steps[0].progress.counts();
    assert_eq!((counts.done, counts.successful), (2, 0));
    assert_eq!(run.steps[1].progress.counts().done, 0);
    assert!(run.script("m1").unwrap().is_step_successful("Step2"));
}

#[tokio::test]
async fn test_pause_before_first_action() {
    let recorder = Recorder::new(false);
    let plan = RunPlan::new(vec![StepDef::new("Step1")]).with_script(
        ScriptSpec::new("m1").with_action(ActionSpec::new("a1", "Recorder", "Step1")),
    );

    let handle = engine(&recorder).start(plan).unwrap();
    handle.pause();
    let state = tokio::time::timeout(WAIT, handle.wait_for_state(|s| s == RunState::Suspended))
        .await
        .unwrap();
    assert_eq!(state, RunState::Suspended);
    assert!(handle.is_suspended());
    assert_eq!(recorder.calls("a1"), 0);

    handle.continue_execution();
    let run = finish(handle).await;
    assert_eq!(recorder.calls("a1"), 1);
    assert!(run.is_successful());
}

#[tokio::test]
async fn test_interrupt_while_suspended() {
    let recorder = Recorder::new(false);
    let plan = RunPlan::new(vec![StepDef::new("Step1"), StepDef::new("Step2")]).with_script(
        ScriptSpec::new("m1")
            .with_action(ActionSpec::new("p1", "Pause", "Step1").with_param("Description", "Check the mailbox"))
            .with_action(ActionSpec::new("a2", "Recorder", "Step2")),
    );

    let handle = engine(&recorder).start(plan).unwrap();
    let suspension = suspended(&handle).await;
    assert_eq!(suspension.reason.as_deref(), Some("Check the mailbox"));

    handle.interrupt();
    let run = finish(handle).await;

    assert_eq!(run.state, RunState::Interrupted);
    assert!(!run.is_successful());
    assert_eq!(recorder.calls("a2"), 0);
    assert!(!run.action("m1", "a2").unwrap().done);
    assert_eq!(run.snapshot().next_step.as_deref(), Some("Step1"));
}

#[tokio::test]
async fn test_interrupt_cancels_running_action() {
    let recorder = Recorder::new(false);
    let plan = RunPlan::new(vec![StepDef::new("Step1")]).with_script(
        ScriptSpec::new("m1")
            .with_action(ActionSpec::new("a1", "Recorder", "Step1").with_param("DelayMs", "10000"))
            .with_action(ActionSpec::new("a2", "Recorder", "Step1")),
    );

    let handle = engine(&recorder).start(plan).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.interrupt();
    let run = finish(handle).await;

    assert_eq!(run.state, RunState::Interrupted);
    let a1 = run.action("m1", "a1").unwrap().result.clone().unwrap();
    assert!(!a1.crashed);
    assert_eq!(a1.comment.as_deref(), Some("Execution has been interrupted."));
    assert_eq!(recorder.calls("a2"), 0);
}

#[tokio::test]
async fn test_update_script_replaces_pending_tail() {
    let recorder = Recorder::new(false);
    let plan = RunPlan::new(vec![StepDef::new("Step1"), StepDef::new("Step2")]).with_script(
        ScriptSpec::new("m1")
            .with_action(ActionSpec::new("p1", "Pause", "Step1"))
            .with_action(ActionSpec::new("a2", "Recorder", "Step2")),
    );

    let handle = engine(&recorder).start(plan).unwrap();
    suspended(&handle).await;

    let (rejected, accepted, _) = tokio::join!(
        handle.update_script("m1", 0, vec![ActionSpec::new("b1", "Recorder", "Step2")]),
        handle.update_script(
            "m1",
            1,
            vec![
                ActionSpec::new("b2", "Recorder", "Step2"),
                ActionSpec::new("b3", "Recorder", "Step2"),
            ],
        ),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.continue_execution();
        }
    );
    assert!(rejected.is_err());
    accepted.unwrap();

    let run = finish(handle).await;
    assert!(run.is_successful());
    assert_eq!(recorder.calls("a2"), 0);
    assert_eq!(recorder.calls("b2"), 1);
    assert_eq!(recorder.calls("b3"), 1);
    assert_eq!(run.step("Step2").unwrap().progress.total(), 2);
}

#[tokio::test]
async fn test_update_after_run_is_rejected() {
    let plan = RunPlan::new(vec![StepDef::new("Step1")]).with_script(
        ScriptSpec::new("m1").with_action(ActionSpec::new("a1", "SetStatic", "Step1")),
    );
    let handle = Engine::new(config()).start(plan).unwrap();
    tokio::time::timeout(WAIT, handle.wait_for_state(|s| s.is_terminal()))
        .await
        .unwrap();

    let result = handle
        .update_script("m1", 1, vec![ActionSpec::new("a2", "SetStatic", "Step1")])
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_resume_from_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileSnapshotStore::new(dir.path().join("run.json"));
    let plan = RunPlan::new(vec![
        StepDef::new("Step1"),
        StepDef::new("Step2"),
        StepDef::new("Step3"),
    ])
    .with_script(
        ScriptSpec::new("m1")
            .with_action(ActionSpec::new("a1", "SetStatic", "Step1").with_param("x", "7"))
            .with_action(ActionSpec::new("p2", "Pause", "Step2"))
            .with_action(
                ActionSpec::new("c3", "Compare", "Step3")
                    .with_param("Expected", "7")
                    .with_param("Actual", "@{a1.x}"),
            ),
    );

    let handle = Engine::new(config()).start(plan).unwrap();
    suspended(&handle).await;
    handle.interrupt();
    let first = finish(handle).await;
    assert_eq!(first.state, RunState::Interrupted);
    store.save(&first.snapshot()).await.unwrap();

    let snapshot = store.load().await.unwrap().unwrap();
    assert_eq!(snapshot.next_step.as_deref(), Some("Step2"));
    let handle = Engine::new(config())
        .start(RunPlan::from_snapshot(snapshot))
        .unwrap();
    let run = finish(handle).await;

    assert_eq!(run.state, RunState::Completed);
    assert!(run.is_successful());
    assert!(run.action("m1", "c3").unwrap().is_passed());
    assert_eq!(run.executed(), 3);
}

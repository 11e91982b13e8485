//! Detached execution of async actions and their join barriers.
//!
//! Actions of one async group run on a dedicated lane task, one at a time in
//! submission order. Actions without a group get their own task. A semaphore
//! bounds how many detached actions execute at once.
//!
//! Completions are sent back to the driver, which applies them at the next
//! poll or join barrier.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::dispatcher::{invoke, Invocation, INTERRUPTED};
use crate::action::{ActionHandler, ActionRequest, ActionResult, Params};
use crate::context::ExecutionScope;
use crate::step::ActionKey;
use crate::variables::SharedVariables;

/// Barrier at which detached actions are awaited.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinScope {
    /// Before the named step starts.
    BeforeStep(String),
    /// At the end of the named step.
    StepEnd(String),
    /// At the end of the run; collects every outstanding action.
    RunEnd,
}

impl std::fmt::Display for JoinScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinScope::BeforeStep(step) => write!(f, "before step '{}'", step),
            JoinScope::StepEnd(step) => write!(f, "end of step '{}'", step),
            JoinScope::RunEnd => write!(f, "end of run"),
        }
    }
}

/// Detached action with everything its worker needs.
pub(crate) struct AsyncJob {
    pub key: ActionKey,
    /// Variable record id; empty for unreferenceable actions.
    pub variable_id: String,
    pub cleanup_key: String,
    pub cleanable_contexts: Vec<String>,
    pub group: Option<String>,
    pub request: ActionRequest,
    pub handler: Arc<dyn ActionHandler>,
    pub scope: ExecutionScope,
    pub variables: SharedVariables,
    pub inverted: bool,
}

/// Final outcome of a detached action.
#[derive(Debug, Clone)]
pub(crate) struct AsyncCompletion {
    pub key: ActionKey,
    pub result: ActionResult,
    pub outputs: Params,
    pub sub_outputs: IndexMap<String, Params>,
    pub finished: DateTime<Utc>,
}

#[derive(Clone)]
struct WorkerContext {
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    completions: mpsc::UnboundedSender<AsyncCompletion>,
}

struct Lane {
    tx: mpsc::UnboundedSender<AsyncJob>,
    handle: JoinHandle<()>,
}

/// Tracks detached actions of one run.
pub(crate) struct AsyncCoordinator {
    worker: WorkerContext,
    lanes: HashMap<String, Lane>,
    ungrouped: Vec<JoinHandle<()>>,
    completions: mpsc::UnboundedReceiver<AsyncCompletion>,
    outstanding: HashSet<ActionKey>,
    scopes: HashMap<JoinScope, HashSet<ActionKey>>,
    /// Steps whose before-step barrier has already been joined.
    reached_steps: HashSet<String>,
    poll_interval: Duration,
}

impl AsyncCoordinator {
    pub fn new(max_workers: usize, poll_interval: Duration, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            worker: WorkerContext {
                semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
                cancel,
                completions: tx,
            },
            lanes: HashMap::new(),
            ungrouped: Vec::new(),
            completions: rx,
            outstanding: HashSet::new(),
            scopes: HashMap::new(),
            reached_steps: HashSet::new(),
            poll_interval,
        }
    }

    /// Number of detached actions whose completion was not collected yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Submit a detached action and declare the barriers that await it.
    ///
    /// A before-step barrier of a step already reached is never joined
    /// again; such actions are collected at the end of the run.
    pub fn detach(&mut self, job: AsyncJob, scopes: Vec<JoinScope>) {
        self.outstanding.insert(job.key);
        for scope in scopes {
            if let JoinScope::BeforeStep(step) = &scope {
                if self.reached_steps.contains(step) {
                    tracing::debug!(
                        action_id = %job.request.action_id,
                        step = %step,
                        "Wait step already reached, action joins at run end"
                    );
                    continue;
                }
            }
            self.scopes.entry(scope).or_default().insert(job.key);
        }

        tracing::debug!(
            action_id = %job.request.action_id,
            group = ?job.group,
            "Action detached"
        );

        let Some(group) = job.group.clone() else {
            self.ungrouped.push(spawn_single(job, self.worker.clone()));
            return;
        };

        let worker = self.worker.clone();
        let lane = self.lanes.entry(group.clone()).or_insert_with(|| spawn_lane(group, worker));
        if let Err(mpsc::error::SendError(job)) = lane.tx.send(job) {
            tracing::error!(action_id = %job.request.action_id, "Async lane closed, running action on its own task");
            self.ungrouped.push(spawn_single(job, self.worker.clone()));
        }
    }

    /// Completions that arrived since the last call, without waiting.
    pub fn poll_finished(&mut self) -> Vec<AsyncCompletion> {
        let mut collected = Vec::new();
        while let Ok(completion) = self.completions.try_recv() {
            self.outstanding.remove(&completion.key);
            collected.push(completion);
        }
        collected
    }

    /// Block until every action declared for `scope` has completed.
    ///
    /// Returns all completions collected while waiting, including ones
    /// outside the scope. Returns early if the run is interrupted.
    pub async fn join_scope(&mut self, scope: &JoinScope) -> Vec<AsyncCompletion> {
        let declared = match scope {
            JoinScope::RunEnd => {
                self.scopes.clear();
                None
            }
            JoinScope::BeforeStep(step) => {
                self.reached_steps.insert(step.clone());
                self.scopes.remove(scope)
            }
            JoinScope::StepEnd(_) => self.scopes.remove(scope),
        };

        let mut collected = self.poll_finished();
        loop {
            let pending = match &declared {
                Some(keys) => keys.iter().filter(|k| self.outstanding.contains(k)).count(),
                None => self.outstanding.len(),
            };
            if pending == 0 {
                break;
            }

            tokio::select! {
                completion = self.completions.recv() => match completion {
                    Some(completion) => {
                        self.outstanding.remove(&completion.key);
                        collected.push(completion);
                    }
                    None => break,
                },
                _ = tokio::time::sleep(self.poll_interval) => {
                    tracing::debug!(scope = %scope, pending, "Waiting for async actions");
                }
                _ = self.worker.cancel.cancelled() => {
                    tracing::info!(scope = %scope, pending, "Join interrupted");
                    break;
                }
            }
        }
        collected
    }

    /// Close every lane, wait for running actions and collect the rest.
    pub async fn shutdown(&mut self) -> Vec<AsyncCompletion> {
        let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut self.ungrouped);
        for (_, lane) in self.lanes.drain() {
            drop(lane.tx);
            handles.push(lane.handle);
        }
        for joined in futures::future::join_all(handles).await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Async worker task failed");
            }
        }
        self.scopes.clear();
        self.poll_finished()
    }
}

fn spawn_lane(group: String, worker: WorkerContext) -> Lane {
    let (tx, mut rx) = mpsc::unbounded_channel::<AsyncJob>();
    let handle = tokio::spawn(async move {
        tracing::debug!(group = %group, "Async lane started");
        while let Some(job) = rx.recv().await {
            run_job(job, &worker).await;
        }
        tracing::debug!(group = %group, "Async lane stopped");
    });
    Lane { tx, handle }
}

fn spawn_single(job: AsyncJob, worker: WorkerContext) -> JoinHandle<()> {
    tokio::spawn(async move { run_job(job, &worker).await })
}

async fn run_job(job: AsyncJob, worker: &WorkerContext) {
    let (result, outputs, sub_outputs) = execute_job(&job, worker).await;

    {
        let mut vars = job.variables.lock();
        if !vars.publish_result(&job.variable_id, Some(&outputs), &sub_outputs, &result)
            && !job.variable_id.is_empty()
        {
            tracing::debug!(action_id = %job.variable_id, "Record already purged, async result dropped");
        }
        vars.cleanup_after(&job.cleanup_key);
    }
    for key in &job.cleanable_contexts {
        job.scope.script.remove(key);
    }

    tracing::info!(
        script = %job.request.script,
        action_id = %job.request.action_id,
        passed = result.is_success(),
        "Async action finished"
    );

    let completion = AsyncCompletion {
        key: job.key,
        result,
        outputs,
        sub_outputs,
        finished: Utc::now(),
    };
    if worker.completions.send(completion).is_err() {
        tracing::warn!(action_id = %job.request.action_id, "Run finished before async completion was collected");
    }
}

async fn execute_job(
    job: &AsyncJob,
    worker: &WorkerContext,
) -> (ActionResult, Params, IndexMap<String, Params>) {
    let interrupted = || (ActionResult::failed(INTERRUPTED), Params::new(), IndexMap::new());

    if worker.cancel.is_cancelled() {
        return interrupted();
    }
    let permit = tokio::select! {
        permit = worker.semaphore.clone().acquire_owned() => permit.ok(),
        _ = worker.cancel.cancelled() => None,
    };
    let Some(_permit) = permit else {
        return interrupted();
    };

    match invoke(job.handler.as_ref(), &job.request, &job.scope).await {
        Invocation::Completed(outcome) => (
            outcome.result.with_inverted(job.inverted),
            outcome.outputs,
            outcome.sub_outputs,
        ),
        Invocation::Failover(e) => {
            tracing::warn!(action_id = %job.request.action_id, error = %e, "Resource failure in async action");
            (ActionResult::failed(e.to_string()), Params::new(), IndexMap::new())
        }
        Invocation::Aborted(result) => (result, Params::new(), IndexMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionOutcome;
    use crate::error::ActionError;
    use crate::variables::VariableStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Sleeps `Millis`, records its id in the shared log, then passes or fails per `Pass`.
    struct LoggingHandler {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ActionHandler for LoggingHandler {
        fn name(&self) -> &'static str {
            "Log"
        }

        async fn execute(
            &self,
            request: &ActionRequest,
            _scope: &ExecutionScope,
        ) -> Result<ActionOutcome, ActionError> {
            let millis: u64 = request.param("Millis").unwrap_or("0").parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            self.log.lock().unwrap().push(request.action_id.clone());
            if request.param("Pass") == Some("false") {
                Ok(ActionOutcome::failed("told to fail"))
            } else {
                Ok(ActionOutcome::passed().with_output("done", "yes"))
            }
        }
    }

    fn job(
        index: usize,
        id: &str,
        group: Option<&str>,
        params: &[(&str, &str)],
        handler: Arc<dyn ActionHandler>,
        variables: &SharedVariables,
    ) -> AsyncJob {
        AsyncJob {
            key: ActionKey::new(0, index),
            variable_id: id.to_string(),
            cleanup_key: id.to_string(),
            cleanable_contexts: Vec::new(),
            group: group.map(str::to_string),
            request: ActionRequest {
                script: "m1".to_string(),
                action_id: id.to_string(),
                action_type: "Log".to_string(),
                step: "Step1".to_string(),
                params: params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<Params>(),
                timeout: Duration::ZERO,
                is_async: true,
                cancel: CancellationToken::new(),
            },
            handler,
            scope: ExecutionScope::detached(),
            variables: variables.clone(),
            inverted: false,
        }
    }

    #[tokio::test]
    async fn test_group_runs_in_submission_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<dyn ActionHandler> = Arc::new(LoggingHandler { log: log.clone() });
        let variables = SharedVariables::new(VariableStore::new());
        let mut coordinator =
            AsyncCoordinator::new(4, Duration::from_millis(10), CancellationToken::new());

        coordinator.detach(
            job(0, "slow", Some("g"), &[("Millis", "40")], handler.clone(), &variables),
            vec![JoinScope::RunEnd],
        );
        coordinator.detach(
            job(1, "fast", Some("g"), &[("Millis", "0")], handler.clone(), &variables),
            vec![JoinScope::RunEnd],
        );

        let completions = coordinator.join_scope(&JoinScope::RunEnd).await;
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[0].key, ActionKey::new(0, 0));
        assert_eq!(*log.lock().unwrap(), vec!["slow".to_string(), "fast".to_string()]);
        assert_eq!(coordinator.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_join_scope_waits_only_for_declared_actions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<dyn ActionHandler> = Arc::new(LoggingHandler { log: log.clone() });
        let variables = SharedVariables::new(VariableStore::new());
        let mut coordinator =
            AsyncCoordinator::new(4, Duration::from_millis(10), CancellationToken::new());

        let step_end = JoinScope::StepEnd("Step1".to_string());
        coordinator.detach(
            job(0, "quick", None, &[("Millis", "10")], handler.clone(), &variables),
            vec![step_end.clone()],
        );
        coordinator.detach(
            job(1, "long", None, &[("Millis", "300")], handler.clone(), &variables),
            vec![JoinScope::RunEnd],
        );

        let completions = coordinator.join_scope(&step_end).await;
        assert!(completions.iter().any(|c| c.key == ActionKey::new(0, 0)));
        assert_eq!(coordinator.outstanding(), 1);

        coordinator.worker.cancel.cancel();
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_for_reached_step_is_not_registered() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<dyn ActionHandler> = Arc::new(LoggingHandler { log });
        let variables = SharedVariables::new(VariableStore::new());
        let mut coordinator =
            AsyncCoordinator::new(2, Duration::from_millis(10), CancellationToken::new());

        let before_step1 = JoinScope::BeforeStep("Step1".to_string());
        coordinator.join_scope(&before_step1).await;
        coordinator.detach(
            job(0, "late", None, &[("Millis", "10")], handler, &variables),
            vec![before_step1],
        );
        assert!(coordinator.scopes.is_empty());
        assert_eq!(coordinator.outstanding(), 1);

        let completions = coordinator.join_scope(&JoinScope::RunEnd).await;
        assert_eq!(completions.len(), 1);
        assert_eq!(coordinator.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_completion_publishes_variables() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<dyn ActionHandler> = Arc::new(LoggingHandler { log });
        let variables = SharedVariables::new(VariableStore::new());
        variables.lock().publish_inputs("a1", &Params::new());
        let mut coordinator =
            AsyncCoordinator::new(1, Duration::from_millis(10), CancellationToken::new());

        coordinator.detach(
            job(0, "a1", None, &[("Pass", "false")], handler, &variables),
            vec![JoinScope::RunEnd],
        );
        let completions = coordinator.join_scope(&JoinScope::RunEnd).await;
        assert!(!completions[0].result.is_success());

        let vars = variables.lock();
        let record = vars.get("a1").unwrap();
        assert!(!record.status.as_ref().unwrap().passed);
    }

    #[tokio::test]
    async fn test_queued_jobs_fail_when_interrupted() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<dyn ActionHandler> = Arc::new(LoggingHandler { log: log.clone() });
        let variables = SharedVariables::new(VariableStore::new());
        let cancel = CancellationToken::new();
        let mut coordinator = AsyncCoordinator::new(1, Duration::from_millis(10), cancel.clone());

        coordinator.detach(
            job(0, "running", Some("g"), &[("Millis", "50")], handler.clone(), &variables),
            vec![JoinScope::RunEnd],
        );
        coordinator.detach(
            job(1, "queued", Some("g"), &[], handler.clone(), &variables),
            vec![JoinScope::RunEnd],
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let mut completions = coordinator.shutdown().await;
        completions.sort_by_key(|c| c.key);
        assert_eq!(completions.len(), 2);
        assert!(completions[0].result.is_success());
        assert_eq!(completions[1].result.comment.as_deref(), Some(INTERRUPTED));
        assert_eq!(*log.lock().unwrap(), vec!["running".to_string()]);
    }
}

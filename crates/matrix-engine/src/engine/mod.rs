//! Run engine: drives scripts through the global steps.
//!
//! [`Engine::start`] validates a [`RunPlan`], builds the run state and
//! spawns the driver task. The returned [`RunHandle`] is the only way to
//! steer the run from outside: pause, replay, failover decisions, script
//! updates and interruption.

mod async_join;
mod dispatcher;
mod driver;
mod failover;
mod handle;
mod state;
mod step_runner;
mod suspension;

pub use async_join::JoinScope;
pub use driver::CompletedRun;
pub use failover::{FailoverDecision, FailoverOutcome, FailoverStatus};
pub use handle::RunHandle;
pub use state::{RunState, RunStatus, StepStatus};
pub use suspension::{SuspendOutcome, SuspensionState};

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::action::{create_default_registry, ActionRegistry};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::expr::{ExpressionEvaluator, TemplateEvaluator};
use crate::plan::RunPlan;
use crate::report::{NoopReportSink, ReportSink};
use crate::script::Script;
use crate::step::{GlobalStep, StepProgress};
use driver::{assign_step_actions, install_cleaning_table, RunDriver};
use handle::RunControl;

/// Entry point for starting runs.
pub struct Engine {
    registry: Arc<ActionRegistry>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    reports: Arc<dyn ReportSink>,
    config: EngineConfig,
}

impl Engine {
    /// Create an engine with the built-in action types.
    pub fn new(config: EngineConfig) -> Self {
        let mut evaluator = TemplateEvaluator::new().with_max_depth(config.max_expression_depth);
        if let Some(dir) = &config.formula_files_dir {
            evaluator = evaluator.with_base_dir(dir.clone());
        }
        Self {
            registry: Arc::new(create_default_registry()),
            evaluator: Arc::new(evaluator),
            reports: Arc::new(NoopReportSink),
            config,
        }
    }

    pub fn with_registry(mut self, registry: ActionRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_report_sink(mut self, reports: Arc<dyn ReportSink>) -> Self {
        self.reports = reports;
        self
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate `plan` and start executing it on a new task.
    ///
    /// Nothing executes when validation fails.
    pub fn start(&self, plan: RunPlan) -> Result<RunHandle, EngineError> {
        self.config.validate()?;
        plan.validate(&self.registry)?;

        let RunPlan {
            steps: defs,
            scripts: specs,
            resume,
        } = plan;

        let mut scripts: Vec<Script> = specs.into_iter().map(Script::from_spec).collect();
        let resume_from = match &resume {
            Some(snapshot) => {
                let index = snapshot.restore(&defs, &mut scripts)?;
                tracing::info!(
                    saved_at = %snapshot.saved_at,
                    next_step = ?snapshot.next_step,
                    "Resuming run from snapshot"
                );
                index
            }
            None => 0,
        };

        let mut steps: Vec<GlobalStep> = defs.into_iter().map(GlobalStep::new).collect();
        for script in &scripts {
            install_cleaning_table(self.evaluator.as_ref(), script, &steps);
        }
        assign_step_actions(&mut steps, &scripts);
        let progress: Vec<(String, Arc<StepProgress>)> = steps
            .iter()
            .map(|s| (s.name().to_string(), s.progress.clone()))
            .collect();

        let control = Arc::new(RunControl::new(&self.config));
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let driver = RunDriver::new(
            scripts,
            steps,
            self.registry.clone(),
            self.evaluator.clone(),
            self.reports.clone(),
            self.config.clone(),
            control.clone(),
            updates_rx,
            resume_from,
        );
        let task = tokio::spawn(driver.run());

        Ok(RunHandle::new(control, updates_tx, progress, task))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

//! Run snapshots for resuming an interrupted run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::action::ActionResult;
use crate::error::EngineError;
use crate::script::{Script, ScriptSpec};
use crate::step::StepDef;
use crate::variables::VariableRecord;

/// Execution state of one action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSnapshot {
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

/// Script definition plus its execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptSnapshot {
    pub spec: ScriptSpec,
    pub step_success: HashMap<String, bool>,
    pub executed: usize,
    pub successful: usize,
    /// One entry per action in `spec.actions`.
    pub actions: Vec<ActionSnapshot>,
    #[serde(default)]
    pub variables: HashMap<String, VariableRecord>,
}

impl ScriptSnapshot {
    pub fn capture(script: &Script) -> Self {
        Self {
            spec: script.to_spec(),
            step_success: script.step_success().clone(),
            executed: script.executed(),
            successful: script.successful(),
            actions: script
                .actions
                .iter()
                .map(|a| ActionSnapshot {
                    done: a.done,
                    result: a.result.clone(),
                    started: a.started,
                    finished: a.finished,
                })
                .collect(),
            variables: script.variables().lock().records().clone(),
        }
    }

    /// Copy the saved state into a script built from the same spec.
    pub fn restore_into(&self, script: &mut Script) -> Result<(), EngineError> {
        if self.spec.name != script.name {
            return Err(EngineError::SnapshotMismatch(format!(
                "expected script '{}', found '{}'",
                self.spec.name, script.name
            )));
        }
        if self.actions.len() != script.actions.len() {
            return Err(EngineError::SnapshotMismatch(format!(
                "script '{}' has {} actions, snapshot has {}",
                script.name,
                script.actions.len(),
                self.actions.len()
            )));
        }
        for (action, saved) in script.actions.iter_mut().zip(&self.actions) {
            action.done = saved.done;
            action.result = saved.result.clone();
            action.started = saved.started;
            action.finished = saved.finished;
        }
        for (step, successful) in &self.step_success {
            script.restore_step_success(step, *successful);
        }
        script.restore_counters(self.executed, self.successful);

        let mut vars = script.variables().lock();
        for (id, record) in &self.variables {
            vars.restore_record(id.clone(), record.clone());
        }
        Ok(())
    }
}

/// Everything needed to resume a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub steps: Vec<StepDef>,
    /// Step to start from; `None` when every step has finished.
    pub next_step: Option<String>,
    pub scripts: Vec<ScriptSnapshot>,
    pub saved_at: DateTime<Utc>,
}

impl RunSnapshot {
    /// Position of the step the resumed run starts with.
    pub fn resume_index(&self, steps: &[StepDef]) -> Result<usize, EngineError> {
        match &self.next_step {
            None => Ok(steps.len()),
            Some(name) => steps.iter().position(|s| &s.name == name).ok_or_else(|| {
                EngineError::SnapshotMismatch(format!("unknown step '{}'", name))
            }),
        }
    }

    /// Restore every script and return the step index to resume from.
    pub fn restore(&self, steps: &[StepDef], scripts: &mut [Script]) -> Result<usize, EngineError> {
        if self.scripts.len() != scripts.len() {
            return Err(EngineError::SnapshotMismatch(format!(
                "plan has {} scripts, snapshot has {}",
                scripts.len(),
                self.scripts.len()
            )));
        }
        for (saved, script) in self.scripts.iter().zip(scripts.iter_mut()) {
            saved.restore_into(script)?;
        }
        self.resume_index(steps)
    }
}

/// Persistence of run snapshots between runs.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &RunSnapshot) -> Result<(), EngineError>;

    /// Load the saved snapshot, if any.
    async fn load(&self) -> Result<Option<RunSnapshot>, EngineError>;
}

/// Snapshot store backed by one JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileSnapshotStore {
    path: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for JsonFileSnapshotStore {
    async fn save(&self, snapshot: &RunSnapshot) -> Result<(), EngineError> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, json).await?;
        tracing::info!(path = %self.path.display(), "Run snapshot saved");
        Ok(())
    }

    async fn load(&self) -> Result<Option<RunSnapshot>, EngineError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

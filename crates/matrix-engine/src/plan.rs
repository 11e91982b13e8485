//! Run plans: step definitions plus the scripts to execute.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::action::{ActionRegistry, FlagExpr};
use crate::error::EngineError;
use crate::script::ScriptSpec;
use crate::snapshot::RunSnapshot;
use crate::step::StepDef;

/// Input of [`crate::Engine::start`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPlan {
    pub steps: Vec<StepDef>,

    #[serde(default)]
    pub scripts: Vec<ScriptSpec>,

    /// Saved state to resume from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<RunSnapshot>,
}

impl RunPlan {
    pub fn new(steps: Vec<StepDef>) -> Self {
        Self {
            steps,
            scripts: Vec::new(),
            resume: None,
        }
    }

    pub fn with_script(mut self, script: ScriptSpec) -> Self {
        self.scripts.push(script);
        self
    }

    /// Resume from `snapshot` instead of starting fresh.
    pub fn restore(mut self, snapshot: RunSnapshot) -> Self {
        self.resume = Some(snapshot);
        self
    }

    /// Plan that resumes exactly the run the snapshot was taken from.
    pub fn from_snapshot(snapshot: RunSnapshot) -> Self {
        Self {
            steps: snapshot.steps.clone(),
            scripts: snapshot.scripts.iter().map(|s| s.spec.clone()).collect(),
            resume: Some(snapshot),
        }
    }

    /// Load a plan from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Check everything that must hold before any action executes.
    pub fn validate(&self, registry: &ActionRegistry) -> Result<(), EngineError> {
        if self.steps.is_empty() {
            return Err(EngineError::NoSteps);
        }

        let mut step_names = HashSet::new();
        for step in &self.steps {
            if !step_names.insert(step.name.as_str()) {
                return Err(EngineError::DuplicateStep(step.name.clone()));
            }
            step.validate_start_at().map_err(EngineError::InvalidStartTime)?;
        }

        let mut executable = false;
        for script in &self.scripts {
            if !script.errors.is_empty() {
                if script.fatal {
                    return Err(EngineError::FatalScript {
                        script: script.name.clone(),
                        errors: script.errors.join("; "),
                    });
                }
                for error in &script.errors {
                    tracing::warn!(script = %script.name, error = %error, "Script compiled with errors");
                }
            }

            let mut ids = HashSet::new();
            for action in &script.actions {
                let label = if action.id.is_empty() {
                    format!("<{}>", action.action_type)
                } else {
                    action.id.clone()
                };
                for step in std::iter::once(&action.step).chain(action.wait_async_end_step.as_ref()) {
                    if !step_names.contains(step.as_str()) {
                        return Err(EngineError::UnknownStep {
                            script: script.name.clone(),
                            action: label,
                            step: step.clone(),
                        });
                    }
                }
                if !registry.has(&action.action_type) {
                    return Err(EngineError::UnknownActionType {
                        script: script.name.clone(),
                        action: label,
                        action_type: action.action_type.clone(),
                    });
                }
                if !action.id.is_empty() && !ids.insert(action.id.as_str()) {
                    return Err(EngineError::DuplicateActionId {
                        script: script.name.clone(),
                        action: action.id.clone(),
                    });
                }
                if action.executable != FlagExpr::Value(false) {
                    executable = true;
                }
            }
        }

        if !executable && self.resume.is_none() {
            return Err(EngineError::NoExecutableActions);
        }
        Ok(())
    }
}

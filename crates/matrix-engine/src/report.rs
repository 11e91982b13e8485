//! Report sinks receiving completed actions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use crate::action::{Action, ActionResult};
use crate::step::StepDef;

/// Destination of per-action reports.
///
/// `write` may be called again for an action whose async completion arrived
/// after its step was finalized; sinks must accept that.
pub trait ReportSink: Send + Sync {
    /// Write or rewrite the report of one action.
    fn write(&self, action: &Action, destination: &Path, step_safe_name: &str) -> Result<()>;

    /// Called once per step after its last action.
    fn finalize(&self, _step: &StepDef, _destination: &Path) -> Result<()> {
        Ok(())
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReportSink;

impl ReportSink for NoopReportSink {
    fn write(&self, _action: &Action, _destination: &Path, _step_safe_name: &str) -> Result<()> {
        Ok(())
    }
}

/// Report line for one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub script: String,
    pub action_id: String,
    pub unique_id: Uuid,
    pub action_type: String,
    pub step: String,
    pub step_safe_name: String,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub result: Option<ActionResult>,
}

impl ReportEntry {
    pub fn from_action(action: &Action, step_safe_name: &str) -> Self {
        Self {
            script: action.matrix_id.clone(),
            action_id: action.display_id(),
            unique_id: action.unique_id,
            action_type: action.action_type.clone(),
            step: action.step_name.clone(),
            step_safe_name: step_safe_name.to_string(),
            started: action.started,
            finished: action.finished,
            result: action.result.clone(),
        }
    }

    pub fn passed(&self) -> bool {
        self.result.as_ref().map(|r| r.is_success()).unwrap_or(false)
    }
}

/// In-memory sink; a rewrite replaces the earlier entry of the same action.
#[derive(Debug, Default)]
pub struct MemoryReportSink {
    entries: Mutex<Vec<ReportEntry>>,
    finalized: Mutex<Vec<String>>,
}

impl MemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ReportEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Entry of the action with the given id in the given script.
    pub fn entry(&self, script: &str, action_id: &str) -> Option<ReportEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|e| e.script == script && e.action_id == action_id)
            .cloned()
    }

    /// Names of finalized steps, in finalization order.
    pub fn finalized_steps(&self) -> Vec<String> {
        self.finalized.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ReportSink for MemoryReportSink {
    fn write(&self, action: &Action, _destination: &Path, step_safe_name: &str) -> Result<()> {
        let entry = ReportEntry::from_action(action, step_safe_name);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.iter_mut().find(|e| e.unique_id == entry.unique_id) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        Ok(())
    }

    fn finalize(&self, step: &StepDef, _destination: &Path) -> Result<()> {
        self.finalized
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(step.name.clone());
        Ok(())
    }
}

/// Appends one JSON line per report to `<destination>/<step>.jsonl`.
///
/// Rewrites of async actions are appended as well; the last line of an
/// action wins when the file is read back.
#[derive(Debug, Default)]
pub struct JsonLinesReportSink {
    lock: Mutex<()>,
}

impl JsonLinesReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn file_path(destination: &Path, step_safe_name: &str) -> PathBuf {
        destination.join(format!("{}.jsonl", step_safe_name))
    }

    /// Read a step file back, keeping the last line of every action.
    pub fn read_step(destination: &Path, step_safe_name: &str) -> Result<Vec<ReportEntry>> {
        let path = Self::file_path(destination, step_safe_name);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read report {}", path.display()))?;
        let mut entries: Vec<ReportEntry> = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let entry: ReportEntry = serde_json::from_str(line)?;
            match entries.iter_mut().find(|e| e.unique_id == entry.unique_id) {
                Some(existing) => *existing = entry,
                None => entries.push(entry),
            }
        }
        Ok(entries)
    }
}

impl ReportSink for JsonLinesReportSink {
    fn write(&self, action: &Action, destination: &Path, step_safe_name: &str) -> Result<()> {
        let line = serde_json::to_string(&ReportEntry::from_action(action, step_safe_name))?;
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        std::fs::create_dir_all(destination)
            .with_context(|| format!("Failed to create report directory {}", destination.display()))?;
        let path = Self::file_path(destination, step_safe_name);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open report {}", path.display()))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn finalize(&self, step: &StepDef, destination: &Path) -> Result<()> {
        tracing::debug!(
            step = %step.name,
            path = %Self::file_path(destination, &step.safe_name()).display(),
            "Step report finalized"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionSpec;

    fn action(id: &str) -> Action {
        let mut action = Action::from_spec("m1", ActionSpec::new(id, "SetStatic", "Step 1"));
        action.result = Some(ActionResult::passed());
        action
    }

    #[test]
    fn test_memory_sink_rewrite_replaces_entry() {
        let sink = MemoryReportSink::new();
        let mut a1 = action("a1");
        sink.write(&a1, Path::new("reports"), "Step 1").unwrap();
        a1.result = Some(ActionResult::failed("late failure"));
        sink.write(&a1, Path::new("reports"), "Step 1").unwrap();

        assert_eq!(sink.entries().len(), 1);
        assert!(!sink.entry("m1", "a1").unwrap().passed());

        sink.finalize(&StepDef::new("Step 1"), Path::new("reports")).unwrap();
        assert_eq!(sink.finalized_steps(), vec!["Step 1".to_string()]);
    }

    #[test]
    fn test_json_lines_sink() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesReportSink::new();
        let mut a1 = action("a1");
        let a2 = action("a2");

        sink.write(&a1, dir.path(), "Step_1").unwrap();
        sink.write(&a2, dir.path(), "Step_1").unwrap();
        a1.result = Some(ActionResult::crashed("boom"));
        sink.write(&a1, dir.path(), "Step_1").unwrap();

        let entries = JsonLinesReportSink::read_step(dir.path(), "Step_1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action_id, "a1");
        assert!(entries[0].result.as_ref().unwrap().crashed);
        assert!(entries[1].passed());
    }
}

//! Global steps.

use chrono::{DateTime, Local, NaiveTime, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Point in time a relative `start_at` is counted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartAtType {
    /// End of the previous step.
    #[default]
    EndOfPrevStep,
    /// Start of the previous step.
    StartOfPrevStep,
    /// Start of the run.
    StartOfRun,
    /// Start of the first executed step.
    StartOfFirstStep,
}

fn default_true() -> bool {
    true
}

/// Step definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub name: String,

    #[serde(default)]
    pub kind: String,

    /// `HH:MM[:SS]` wall-clock time, or `+HH:MM[:SS]` relative to `start_at_type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<String>,

    #[serde(default)]
    pub start_at_type: StartAtType,

    /// Wait until tomorrow when the wall-clock start time has passed.
    #[serde(default)]
    pub wait_next_day: bool,

    /// Suspend when the step ends, whatever the outcome.
    #[serde(default)]
    pub ask_for_continue: bool,

    /// Suspend when the step ends with failed actions.
    #[serde(default)]
    pub ask_if_failed: bool,

    /// Actions of a non-executed step are recorded as not executed.
    #[serde(default = "default_true")]
    pub execute: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl StepDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: String::new(),
            start_at: None,
            start_at_type: StartAtType::default(),
            wait_next_day: false,
            ask_for_continue: false,
            ask_if_failed: false,
            execute: true,
            comment: None,
        }
    }

    pub fn with_ask_if_failed(mut self, ask: bool) -> Self {
        self.ask_if_failed = ask;
        self
    }

    pub fn with_ask_for_continue(mut self, ask: bool) -> Self {
        self.ask_for_continue = ask;
        self
    }

    pub fn with_execute(mut self, execute: bool) -> Self {
        self.execute = execute;
        self
    }

    pub fn with_start_at(mut self, start_at: impl Into<String>, start_at_type: StartAtType) -> Self {
        self.start_at = Some(start_at.into());
        self.start_at_type = start_at_type;
        self
    }

    /// Name usable as a file name, e.g. for report files.
    pub fn safe_name(&self) -> String {
        safe_name(&self.name)
    }
}

/// Replace characters that are not allowed in file names.
pub fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '.' | '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\'' => '_',
            other => other,
        })
        .collect()
}

/// Position of an action: script index and index within the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionKey {
    pub script: usize,
    pub index: usize,
}

impl ActionKey {
    pub fn new(script: usize, index: usize) -> Self {
        Self { script, index }
    }
}

/// Counter values of a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounts {
    pub done: usize,
    pub successful: usize,
}

impl ProgressCounts {
    pub fn has_failures(&self) -> bool {
        self.successful < self.done
    }
}

/// Step counters shared with status readers.
///
/// Both counters live under one lock so readers never see a half update.
#[derive(Debug, Default)]
pub struct StepProgress {
    counts: Mutex<ProgressCounts>,
    total: AtomicUsize,
}

impl StepProgress {
    /// Number of actions assigned to the step.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub(crate) fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn counts(&self) -> ProgressCounts {
        *self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn record(&self, passed: bool) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.done += 1;
        if passed {
            counts.successful += 1;
        }
    }

    pub(crate) fn withdraw_success(&self) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.successful = counts.successful.saturating_sub(1);
    }

    pub(crate) fn reset(&self) {
        *self.counts.lock().unwrap_or_else(|e| e.into_inner()) = ProgressCounts::default();
    }
}

/// A step shared by all scripts, with the flattened list of its actions.
#[derive(Debug)]
pub struct GlobalStep {
    pub def: StepDef,

    /// Actions of every script, grouped by script in declared order.
    pub actions: Vec<ActionKey>,

    pub progress: Arc<StepProgress>,

    /// Index into `actions` of the action being executed.
    pub(crate) cursor: usize,

    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub status_comment: Option<String>,
}

impl GlobalStep {
    pub fn new(def: StepDef) -> Self {
        Self {
            def,
            actions: Vec::new(),
            progress: Arc::new(StepProgress::default()),
            cursor: 0,
            started: None,
            finished: None,
            status_comment: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Move the cursor back to `position`; only used when upcoming actions are replaced.
    pub(crate) fn rewind_to(&mut self, position: usize) {
        self.cursor = self.cursor.min(position);
    }
}

/// Timestamps a relative start time can refer to.
#[derive(Debug, Clone, Copy)]
pub struct StartReference {
    pub run_started: DateTime<Local>,
    pub first_step_started: Option<DateTime<Local>>,
    pub prev_step_started: Option<DateTime<Local>>,
    pub prev_step_finished: Option<DateTime<Local>>,
}

fn parse_hms(text: &str) -> Option<(i64, i64, i64)> {
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return None;
    }
    let h = parts[0].trim().parse().ok()?;
    let m = parts[1].trim().parse().ok()?;
    let s = match parts.get(2) {
        Some(s) => s.trim().parse().ok()?,
        None => 0,
    };
    Some((h, m, s))
}

/// Parsed `start_at` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartAt {
    Relative(TimeDelta),
    WallClock(NaiveTime),
}

fn parse_start_at(def: &StepDef) -> Result<Option<StartAt>, String> {
    let Some(start_at) = def.start_at.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let bad_format = || {
        format!(
            "Step '{}': error while parsing 'Start at' parameter ({}), it must be in format 'HH:mm:ss' with optional '+' in the beginning",
            def.name, start_at
        )
    };

    if let Some(relative) = start_at.strip_prefix('+') {
        let (h, m, s) = parse_hms(relative).ok_or_else(bad_format)?;
        let seconds = h
            .checked_mul(3600)
            .and_then(|hs| hs.checked_add(m.checked_mul(60)?))
            .and_then(|hms| hms.checked_add(s))
            .ok_or_else(bad_format)?;
        let delta = TimeDelta::try_seconds(seconds).ok_or_else(bad_format)?;
        return Ok(Some(StartAt::Relative(delta)));
    }

    let (h, m, s) = parse_hms(start_at).ok_or_else(bad_format)?;
    let [h, m, s] = [h, m, s].map(|v| u32::try_from(v).ok());
    let time = match (h, m, s) {
        (Some(h), Some(m), Some(s)) => NaiveTime::from_hms_opt(h, m, s),
        _ => None,
    };
    Ok(Some(StartAt::WallClock(time.ok_or_else(bad_format)?)))
}

impl StepDef {
    /// Check that `start_at` can be parsed.
    pub fn validate_start_at(&self) -> Result<(), String> {
        parse_start_at(self).map(|_| ())
    }
}

/// Compute when a step may start.
///
/// Returns `Ok(None)` when no wait is needed, or an error message when
/// `start_at` is malformed.
pub fn start_time(
    def: &StepDef,
    reference: &StartReference,
    now: DateTime<Local>,
) -> Result<Option<DateTime<Local>>, String> {
    let out_of_range = || format!("Step '{}': start time is out of range", def.name);

    match parse_start_at(def)? {
        None => Ok(None),
        Some(StartAt::Relative(delta)) => {
            let base = match def.start_at_type {
                StartAtType::EndOfPrevStep => reference.prev_step_finished,
                StartAtType::StartOfPrevStep => reference.prev_step_started,
                StartAtType::StartOfRun => Some(reference.run_started),
                StartAtType::StartOfFirstStep => {
                    reference.first_step_started.or(Some(reference.run_started))
                }
            }
            .unwrap_or(now);
            let target = base.checked_add_signed(delta).ok_or_else(out_of_range)?;
            Ok((target > now).then_some(target))
        }
        Some(StartAt::WallClock(time)) => {
            let target = Local
                .from_local_datetime(&now.date_naive().and_time(time))
                .earliest()
                .ok_or_else(out_of_range)?;
            if target > now {
                Ok(Some(target))
            } else if def.wait_next_day {
                Ok(Some(target + TimeDelta::days(1)))
            } else {
                Ok(None)
            }
        }
    }
}

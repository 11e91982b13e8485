//! Inter-action variables with bounded lifetime.
//!
//! Every referenceable action gets a [`VariableRecord`] when its inputs are
//! resolved. The record is updated once the result is known and removed as
//! soon as the last action that may reference it has completed, as decided
//! by the cleaning table built at compile time.

pub mod cleaning;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::action::{ActionResult, FailReason, Params};

pub use cleaning::{CleaningTable, CleaningTableBuilder};

/// Name under which formulas see the inputs of the action being resolved.
pub const THIS_ACTION: &str = "thisAction";
/// Name under which formulas see the last published record.
pub const PREV_ACTION: &str = "prevAction";
/// Name under which formulas see script constants.
pub const CONSTANTS: &str = "constants";

/// Pass/fail summary published for an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStatus {
    pub passed: bool,
    pub fail_reason: FailReason,
}

impl From<&ActionResult> for ActionStatus {
    fn from(result: &ActionResult) -> Self {
        Self {
            passed: result.is_success(),
            fail_reason: result.effective_fail_reason(),
        }
    }
}

/// Variables of one action as seen by formulas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableRecord {
    pub inputs: Params,
    pub outputs: Option<Params>,
    pub status: Option<ActionStatus>,
    pub sub_records: IndexMap<String, Params>,
}

impl VariableRecord {
    /// Formula view: inputs at top level, plus `in`, `out`, `action` and `sub`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for (k, v) in &self.inputs {
            map.insert(k.clone(), Value::String(v.clone()));
        }
        map.insert("in".to_string(), params_to_value(&self.inputs));
        map.insert(
            "out".to_string(),
            self.outputs
                .as_ref()
                .map(params_to_value)
                .unwrap_or_else(|| Value::Object(Map::new())),
        );
        if let Some(status) = &self.status {
            map.insert(
                "action".to_string(),
                json!({
                    "passed": status.passed,
                    "failReason": status.fail_reason.to_string(),
                }),
            );
        }
        if !self.sub_records.is_empty() {
            let subs: Map<String, Value> = self
                .sub_records
                .iter()
                .map(|(id, params)| (id.clone(), params_to_value(params)))
                .collect();
            map.insert("sub".to_string(), Value::Object(subs));
        }
        Value::Object(map)
    }
}

fn params_to_value(params: &Params) -> Value {
    Value::Object(
        params
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Per-script store of variable records.
#[derive(Debug, Default)]
pub struct VariableStore {
    records: HashMap<String, VariableRecord>,
    cleaning: CleaningTable,
    constants: Params,
    prev_action: Option<VariableRecord>,
    /// Purged records kept while the running step may still be replayed,
    /// with the referrer that released them.
    replay_backup: Option<HashMap<String, (String, VariableRecord)>>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store exposing the given script constants.
    pub fn with_constants(constants: Params) -> Self {
        Self {
            constants,
            ..Self::default()
        }
    }

    pub fn set_cleaning_table(&mut self, table: CleaningTable) {
        self.cleaning = table;
    }

    pub fn cleaning_table(&self) -> &CleaningTable {
        &self.cleaning
    }

    pub fn constants(&self) -> &Params {
        &self.constants
    }

    /// Record resolved inputs, replacing any previous record for the id.
    pub fn publish_inputs(&mut self, action_id: &str, inputs: &Params) {
        if action_id.is_empty() {
            return;
        }
        let record = self.records.entry(action_id.to_string()).or_default();
        record.inputs = inputs.clone();
        record.outputs = None;
        record.status = None;
        record.sub_records.clear();
    }

    /// Record outputs and status.
    ///
    /// Returns false if the record was already purged, in which case the
    /// result is dropped.
    pub fn publish_result(
        &mut self,
        action_id: &str,
        outputs: Option<&Params>,
        sub_outputs: &IndexMap<String, Params>,
        result: &ActionResult,
    ) -> bool {
        if action_id.is_empty() {
            return false;
        }
        let Some(record) = self.records.get_mut(action_id) else {
            return false;
        };
        record.outputs = outputs.cloned();
        record.sub_records = sub_outputs.clone();
        record.status = Some(ActionStatus::from(result));
        self.prev_action = Some(record.clone());
        true
    }

    /// Every live record, keyed by action id.
    pub fn records(&self) -> &HashMap<String, VariableRecord> {
        &self.records
    }

    /// Put back a record saved in a snapshot.
    pub fn restore_record(&mut self, action_id: impl Into<String>, record: VariableRecord) {
        self.records.insert(action_id.into(), record);
    }

    pub fn get(&self, action_id: &str) -> Option<&VariableRecord> {
        self.records.get(action_id)
    }

    pub fn contains(&self, action_id: &str) -> bool {
        self.records.contains_key(action_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove every record whose last referrer is `action_id`.
    ///
    /// Returns the removed ids. The table entry stays, so a referrer that
    /// runs again on replay releases the same records again.
    pub fn cleanup_after(&mut self, action_id: &str) -> Vec<String> {
        if action_id.is_empty() {
            return Vec::new();
        }
        let Some(targets) = self.cleaning.get(action_id) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        for id in targets {
            let Some(record) = self.records.remove(id) else {
                continue;
            };
            if let Some(backup) = self.replay_backup.as_mut() {
                backup.insert(id.clone(), (action_id.to_string(), record));
            }
            removed.push(id.clone());
        }
        removed
    }

    /// Keep purged records aside until [`Self::end_replay_window`].
    ///
    /// Called when a step that may be replayed starts.
    pub fn begin_replay_window(&mut self) {
        self.replay_backup.get_or_insert_with(HashMap::new);
    }

    /// Drop the records kept aside; the step can no longer be replayed.
    pub fn end_replay_window(&mut self) {
        self.replay_backup = None;
    }

    /// Put back the records released by `referrers` since the replay
    /// window began; other kept records are dropped.
    ///
    /// Records published again in the meantime are left as they are.
    /// Returns the number of restored records.
    pub fn restore_for_replay(&mut self, referrers: &HashSet<String>) -> usize {
        let Some(backup) = self.replay_backup.as_mut() else {
            return 0;
        };
        let mut restored = 0;
        for (id, (referrer, record)) in backup.drain() {
            if !referrers.contains(&referrer) {
                continue;
            }
            if let Entry::Vacant(slot) = self.records.entry(id) {
                slot.insert(record);
                restored += 1;
            }
        }
        restored
    }

    /// Drop every record and the previous-action snapshot.
    pub fn clear(&mut self) {
        self.records.clear();
        self.prev_action = None;
    }

    /// Template context for formula evaluation.
    pub fn to_context(&self, this_action: Option<&Params>) -> Value {
        let mut map = Map::new();
        for (id, record) in &self.records {
            map.insert(id.clone(), record.to_value());
        }
        map.insert(CONSTANTS.to_string(), params_to_value(&self.constants));
        if let Some(prev) = &self.prev_action {
            map.insert(PREV_ACTION.to_string(), prev.to_value());
        }
        if let Some(inputs) = this_action {
            map.insert(THIS_ACTION.to_string(), params_to_value(inputs));
        }
        Value::Object(map)
    }
}

/// Variable store shared between the driver and async workers.
#[derive(Debug, Clone, Default)]
pub struct SharedVariables(Arc<Mutex<VariableStore>>);

impl SharedVariables {
    pub fn new(store: VariableStore) -> Self {
        Self(Arc::new(Mutex::new(store)))
    }

    pub fn lock(&self) -> MutexGuard<'_, VariableStore> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

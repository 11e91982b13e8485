//! Cleaning table construction.

use std::collections::{BTreeSet, HashMap};

use crate::action::Action;
use crate::expr::{ExpressionEvaluator, ReferenceFinder};

/// Referrer id -> ids whose records can be dropped once the referrer completes.
pub type CleaningTable = HashMap<String, BTreeSet<String>>;

/// Builds the cleaning table for one script.
///
/// Walks actions in execution order and remembers, for every referenced id,
/// the last action referencing it. An action is its own first referrer, so an
/// id nobody references is dropped right after its own completion.
pub struct CleaningTableBuilder<'a> {
    finder: ReferenceFinder,
    evaluator: &'a dyn ExpressionEvaluator,
}

impl<'a> CleaningTableBuilder<'a> {
    pub fn new(evaluator: &'a dyn ExpressionEvaluator) -> Self {
        Self {
            finder: ReferenceFinder::new(),
            evaluator,
        }
    }

    /// Ids referenced by the formula-bearing fields of `action`.
    pub fn references(&self, action: &Action) -> BTreeSet<String> {
        let mut refs = BTreeSet::new();
        let flags = [
            &action.executable,
            &action.inverted,
            &action.is_async,
            &action.suspend_if_failed,
        ];
        let texts = action
            .input_params
            .values()
            .map(String::as_str)
            .chain(flags.iter().filter_map(|f| f.formula()));

        for text in texts {
            refs.extend(self.finder.find(text));
            for content in self.evaluator.embedded_content(text) {
                refs.extend(self.finder.find(&content));
            }
        }
        refs
    }

    /// Build the table for actions given in final execution order.
    pub fn build<'b>(&self, actions: impl IntoIterator<Item = &'b Action>) -> CleaningTable {
        let mut last_referrer: HashMap<String, String> = HashMap::new();

        for action in actions {
            let referrer = action.cleanup_key();
            if action.is_referenceable() {
                last_referrer.insert(action.id_in_matrix.clone(), referrer.clone());
            }
            for id in self.references(action) {
                last_referrer.insert(id, referrer.clone());
            }
        }

        let mut table = CleaningTable::new();
        for (id, referrer) in last_referrer {
            table.entry(referrer).or_default().insert(id);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionSpec;
    use crate::expr::TemplateEvaluator;

    fn action(id: &str, params: &[(&str, &str)]) -> Action {
        let mut spec = ActionSpec::new(id, "SetStatic", "Step1");
        for (k, v) in params {
            spec = spec.with_param(*k, *v);
        }
        Action::from_spec("m1", spec)
    }

    #[test]
    fn test_unreferenced_action_is_own_last_referrer() {
        let evaluator = TemplateEvaluator::new();
        let actions = vec![action("a1", &[("x", "1")])];
        let table = CleaningTableBuilder::new(&evaluator).build(&actions);
        assert_eq!(table.get("a1"), Some(&BTreeSet::from(["a1".to_string()])));
    }

    #[test]
    fn test_last_referrer_wins() {
        let evaluator = TemplateEvaluator::new();
        let actions = vec![
            action("a1", &[("x", "1")]),
            action("a2", &[("y", "@{a1.x}")]),
            action("a3", &[("z", "@{a1.out.id}")]),
        ];
        let table = CleaningTableBuilder::new(&evaluator).build(&actions);

        assert_eq!(table.get("a1"), None);
        assert_eq!(table.get("a2"), Some(&BTreeSet::from(["a2".to_string()])));
        assert_eq!(
            table.get("a3"),
            Some(&BTreeSet::from(["a1".to_string(), "a3".to_string()]))
        );
    }

    #[test]
    fn test_unreferenceable_referrer_keeps_record_alive() {
        let evaluator = TemplateEvaluator::new();
        let actions = vec![action("a1", &[("x", "1")]), action("", &[("y", "@{a1.x}")])];
        let table = CleaningTableBuilder::new(&evaluator).build(&actions);

        let key = actions[1].cleanup_key();
        assert_eq!(table.get(&key), Some(&BTreeSet::from(["a1".to_string()])));
        assert!(table.get("a1").is_none());
    }

    #[test]
    fn test_special_names_are_not_references() {
        let evaluator = TemplateEvaluator::new();
        let actions = vec![action(
            "a1",
            &[("x", "@{thisAction.y} @{prevAction.out.id} @{constants.env}")],
        )];
        let table = CleaningTableBuilder::new(&evaluator).build(&actions);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("a1"), Some(&BTreeSet::from(["a1".to_string()])));
    }

    #[test]
    fn test_references_inside_embedded_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("query.txt"), "select @{a1.out.id}").unwrap();
        let evaluator = TemplateEvaluator::new().with_base_dir(dir.path());

        let actions = vec![
            action("a1", &[]),
            action("a2", &[]),
            action("a3", &[("q", "@{file('query.txt')}")]),
        ];
        let table = CleaningTableBuilder::new(&evaluator).build(&actions);
        assert!(table.get("a3").unwrap().contains("a1"));
        assert!(table.get("a2").unwrap().contains("a2"));
    }
}

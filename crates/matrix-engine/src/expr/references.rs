//! Discovery of action references inside formulas.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::variables::{CONSTANTS, PREV_ACTION, THIS_ACTION};

/// Names that look like references but never denote an action.
const RESERVED: &[&str] = &[THIS_ACTION, PREV_ACTION, CONSTANTS, "in", "out", "action", "loop"];

static IDENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\w.])([A-Za-z_]\w*)\s*[.\[]").expect("identifier pattern is valid")
});

static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"'[^']*'|"[^"]*""#).expect("quoted pattern is valid"));

/// Location of one `@{...}` formula within a text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormulaSpan<'a> {
    /// Byte offset of `@{`.
    pub start: usize,
    /// Byte offset just past the closing `}`.
    pub end: usize,
    /// Expression between the braces.
    pub expression: &'a str,
}

/// Returns true if the text contains a formula marker.
pub fn is_formula(text: &str) -> bool {
    text.contains("@{")
}

/// Find all top-level `@{...}` formulas, matching nested braces.
///
/// Braces inside quoted strings are ignored. An unterminated formula is
/// left as plain text.
pub fn formula_spans(text: &str) -> Vec<FormulaSpan<'_>> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;

    while i + 1 < bytes.len() {
        if bytes[i] != b'@' || bytes[i + 1] != b'{' {
            i += 1;
            continue;
        }
        let start = i;
        let body = i + 2;
        let mut depth = 1usize;
        let mut quote: Option<u8> = None;
        let mut j = body;
        while j < bytes.len() {
            let b = bytes[j];
            match quote {
                Some(q) if b == q => quote = None,
                Some(_) => {}
                None => match b {
                    b'\'' | b'"' => quote = Some(b),
                    b'{' => depth += 1,
                    b'}' => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                },
            }
            j += 1;
        }
        if depth != 0 {
            break;
        }
        spans.push(FormulaSpan {
            start,
            end: j + 1,
            expression: &text[body..j],
        });
        i = j + 1;
    }
    spans
}

/// Finds identifiers of actions referenced by formulas.
///
/// A reference is an identifier followed by `.` or `[` that is not itself
/// an attribute of something else, e.g. `a1` in `@{a1.out.id}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceFinder;

impl ReferenceFinder {
    pub fn new() -> Self {
        Self
    }

    /// Referenced action ids in every formula of `text`.
    pub fn find(&self, text: &str) -> BTreeSet<String> {
        let mut refs = BTreeSet::new();
        for span in formula_spans(text) {
            let stripped = QUOTED.replace_all(span.expression, "''");
            for caps in IDENT.captures_iter(&stripped) {
                let name = &caps[1];
                if !RESERVED.contains(&name) {
                    refs.insert(name.to_string());
                }
            }
        }
        refs
    }
}

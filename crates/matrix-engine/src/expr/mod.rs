//! Formula evaluation for action parameters.
//!
//! Formulas are written as `@{expression}` inside parameter values and flag
//! attributes. The default evaluator compiles each expression with
//! minijinja and evaluates it against the variable store of the script.

mod references;

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use minijinja::{Environment, ErrorKind, UndefinedBehavior, Value};
use regex::Regex;

use crate::action::{FlagExpr, Params};
use crate::error::EvalError;
use crate::variables::VariableStore;

pub use references::{formula_spans, is_formula, FormulaSpan, ReferenceFinder};

static FILE_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"file\(\s*(?:'([^']*)'|"([^"]*)")\s*\)"#).expect("file call pattern is valid")
});

/// Evaluates formulas against a variable store.
pub trait ExpressionEvaluator: Send + Sync {
    /// Replace every formula in `text` by its value.
    ///
    /// `this_action` holds the inputs of the action being resolved. Must fail
    /// with [`EvalError::RecursionLimit`] when expansion does not settle.
    fn evaluate(
        &self,
        text: &str,
        variables: &VariableStore,
        this_action: Option<&Params>,
    ) -> Result<String, EvalError>;

    /// Content of externally loaded files referenced by `text`.
    ///
    /// Used without any action context while building the cleaning table.
    fn embedded_content(&self, text: &str) -> Vec<String>;

    /// Resolve a boolean attribute.
    fn evaluate_flag(
        &self,
        flag: &FlagExpr,
        variables: &VariableStore,
        this_action: Option<&Params>,
    ) -> Result<bool, EvalError> {
        match flag {
            FlagExpr::Value(v) => Ok(*v),
            FlagExpr::Formula(text) => parse_flag(&self.evaluate(text, variables, this_action)?),
        }
    }
}

/// Parse a boolean attribute value.
pub fn parse_flag(value: &str) -> Result<bool, EvalError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "y" | "yes" => Ok(true),
        "false" | "0" | "n" | "no" | "" => Ok(false),
        other => Err(EvalError::NotBoolean(other.to_string())),
    }
}

fn load_file(base_dir: Option<&Path>, path: &str) -> Result<String, EvalError> {
    let full = match base_dir {
        Some(dir) => dir.join(path),
        None => PathBuf::from(path),
    };
    std::fs::read_to_string(&full).map_err(|e| EvalError::File {
        path: full.display().to_string(),
        message: e.to_string(),
    })
}

/// Formula evaluator backed by minijinja expressions.
pub struct TemplateEvaluator {
    env: Environment<'static>,
    base_dir: Option<PathBuf>,
    max_depth: usize,
}

impl TemplateEvaluator {
    /// Create an evaluator with the default expansion ceiling.
    pub fn new() -> Self {
        Self {
            env: build_environment(None),
            base_dir: None,
            max_depth: 32,
        }
    }

    /// Resolve `file(...)` paths relative to `dir`.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.env = build_environment(Some(dir.clone()));
        self.base_dir = Some(dir);
        self
    }

    /// Set the expansion ceiling.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth.max(1);
        self
    }

    fn eval_expression(&self, expression: &str, ctx: &Value) -> Result<String, EvalError> {
        let compiled = self
            .env
            .compile_expression(expression)
            .map_err(|e| EvalError::Syntax {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;
        let value = compiled.eval(ctx).map_err(|e| match e.kind() {
            ErrorKind::UndefinedError => EvalError::Unresolved(expression.trim().to_string()),
            _ => EvalError::Syntax {
                expression: expression.to_string(),
                message: e.to_string(),
            },
        })?;
        if value.is_undefined() {
            return Err(EvalError::Unresolved(expression.trim().to_string()));
        }
        Ok(value.to_string())
    }
}

impl Default for TemplateEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TemplateEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEvaluator")
            .field("base_dir", &self.base_dir)
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

fn build_environment(base_dir: Option<PathBuf>) -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_function("file", move |path: String| -> Result<String, minijinja::Error> {
        load_file(base_dir.as_deref(), &path)
            .map_err(|e| minijinja::Error::new(ErrorKind::InvalidOperation, e.to_string()))
    });
    env
}

impl ExpressionEvaluator for TemplateEvaluator {
    fn evaluate(
        &self,
        text: &str,
        variables: &VariableStore,
        this_action: Option<&Params>,
    ) -> Result<String, EvalError> {
        if !is_formula(text) {
            return Ok(text.to_string());
        }
        let ctx = Value::from_serialize(variables.to_context(this_action));

        let mut current = text.to_string();
        for _ in 0..self.max_depth {
            let spans = formula_spans(&current);
            if spans.is_empty() {
                return Ok(current);
            }
            let mut expanded = String::with_capacity(current.len());
            let mut last = 0;
            for span in &spans {
                expanded.push_str(&current[last..span.start]);
                expanded.push_str(&self.eval_expression(span.expression, &ctx)?);
                last = span.end;
            }
            expanded.push_str(&current[last..]);
            current = expanded;
        }

        if formula_spans(&current).is_empty() {
            Ok(current)
        } else {
            Err(EvalError::RecursionLimit(text.to_string()))
        }
    }

    fn embedded_content(&self, text: &str) -> Vec<String> {
        let mut contents = Vec::new();
        for span in formula_spans(text) {
            for caps in FILE_CALL.captures_iter(span.expression) {
                let Some(path) = caps.get(1).or_else(|| caps.get(2)) else {
                    continue;
                };
                match load_file(self.base_dir.as_deref(), path.as_str()) {
                    Ok(content) => contents.push(content),
                    Err(e) => tracing::warn!(error = %e, "Embedded file skipped during reference scan"),
                }
            }
        }
        contents
    }
}

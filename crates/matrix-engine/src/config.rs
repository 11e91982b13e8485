//! Engine configuration.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::EngineError;

/// Engine configuration loaded from environment variables.
///
/// Environment variables are prefixed with `MATRIX_ENGINE_`:
/// - `MATRIX_ENGINE_ASYNC_POLL_INTERVAL_MS`: Join barrier poll interval (default: 1000)
/// - `MATRIX_ENGINE_MAX_ASYNC_WORKERS`: Concurrently running async actions (default: 4)
/// - `MATRIX_ENGINE_ALLOW_DUPLICATE_PARAMS`: Execute actions with repeated parameters (default: false)
/// - `MATRIX_ENGINE_FAILOVER_IGNORED_RESOURCES`: Comma-separated resources whose failures are skipped
/// - `MATRIX_ENGINE_REPORTS_DIR`: Destination directory passed to the report sink
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Poll interval of async join barriers in milliseconds
    #[serde(default = "default_async_poll_interval_ms")]
    pub async_poll_interval_ms: u64,

    /// Upper bound of async actions running at once
    #[serde(default = "default_max_async_workers")]
    pub max_async_workers: usize,

    /// Execute actions even when the script row repeats a parameter
    #[serde(default)]
    pub allow_duplicate_params: bool,

    /// Keep result details in memory after the report is written
    #[serde(default)]
    pub keep_result_details: bool,

    /// Skip every failover without asking the operator
    #[serde(default)]
    pub failover_ignore_all: bool,

    /// Resources whose failovers are skipped without asking the operator
    #[serde(default)]
    pub failover_ignored_resources: Vec<String>,

    /// Directory handed to the report sink
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,

    /// Base directory for files loaded by formulas
    #[serde(default)]
    pub formula_files_dir: Option<PathBuf>,

    /// Expansion ceiling for nested formulas
    #[serde(default = "default_max_expression_depth")]
    pub max_expression_depth: usize,
}

fn default_async_poll_interval_ms() -> u64 {
    1000
}

fn default_max_async_workers() -> usize {
    4
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("reports")
}

fn default_max_expression_depth() -> usize {
    32
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `MATRIX_ENGINE_`.
    pub fn from_env() -> Result<Self, EngineError> {
        let config = envy::prefixed("MATRIX_ENGINE_").from_env::<EngineConfig>()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_async_workers == 0 {
            return Err(EngineError::Configuration(
                "max_async_workers must be greater than 0".to_string(),
            ));
        }
        if self.max_expression_depth == 0 {
            return Err(EngineError::Configuration(
                "max_expression_depth must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Join barrier poll interval.
    pub fn async_poll_interval(&self) -> Duration {
        Duration::from_millis(self.async_poll_interval_ms.max(1))
    }

    /// Set the join barrier poll interval.
    pub fn with_async_poll_interval(mut self, interval: Duration) -> Self {
        self.async_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the async worker bound.
    pub fn with_max_async_workers(mut self, workers: usize) -> Self {
        self.max_async_workers = workers;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            async_poll_interval_ms: default_async_poll_interval_ms(),
            max_async_workers: default_max_async_workers(),
            allow_duplicate_params: false,
            keep_result_details: false,
            failover_ignore_all: false,
            failover_ignored_resources: Vec::new(),
            reports_dir: default_reports_dir(),
            formula_files_dir: None,
            max_expression_depth: default_max_expression_depth(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.async_poll_interval_ms, 1000);
        assert_eq!(config.max_async_workers, 4);
        assert!(!config.allow_duplicate_params);
        assert_eq!(config.reports_dir, PathBuf::from("reports"));
        assert_eq!(config.max_expression_depth, 32);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = EngineConfig::default().with_max_async_workers(0);
        assert!(matches!(
            config.validate(),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_config_from_iter() {
        let vars = vec![
            ("MATRIX_ENGINE_MAX_ASYNC_WORKERS".to_string(), "8".to_string()),
            (
                "MATRIX_ENGINE_FAILOVER_IGNORED_RESOURCES".to_string(),
                "db,mq".to_string(),
            ),
        ];
        let config: EngineConfig = envy::prefixed("MATRIX_ENGINE_")
            .from_iter(vars)
            .unwrap();
        assert_eq!(config.max_async_workers, 8);
        assert_eq!(config.failover_ignored_resources, vec!["db", "mq"]);
        assert_eq!(config.async_poll_interval_ms, 1000);
    }
}

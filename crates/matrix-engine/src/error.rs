//! Engine error types.

use thiserror::Error;

/// Errors that abort a run or reject a control request.
///
/// Run-fatal variants are returned synchronously from `Engine::start`
/// before any action executes.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The plan declares no steps.
    #[error("No steps defined")]
    NoSteps,

    /// Two steps share the same name.
    #[error("Duplicate step name: {0}")]
    DuplicateStep(String),

    /// A step's start time cannot be parsed.
    #[error("Invalid start time: {0}")]
    InvalidStartTime(String),

    /// An action is assigned to a step that does not exist.
    #[error("Script '{script}': action '{action}' refers to unknown step '{step}'")]
    UnknownStep {
        script: String,
        action: String,
        step: String,
    },

    /// No handler is registered for an action type.
    #[error("Script '{script}': action '{action}' has unknown type '{action_type}'")]
    UnknownActionType {
        script: String,
        action: String,
        action_type: String,
    },

    /// Two actions of one script share an identifier.
    #[error("Script '{script}': duplicate action id '{action}'")]
    DuplicateActionId { script: String, action: String },

    /// The script generator reported fatal compile errors.
    #[error("Script '{script}' contains fatal errors: {errors}")]
    FatalScript { script: String, errors: String },

    /// Nothing in the plan would be executed.
    #[error("No executable actions in scripts")]
    NoExecutableActions,

    /// The run has already finished and cannot be controlled.
    #[error("Run is not active")]
    RunNotActive,

    /// A hot-swap of script actions was rejected.
    #[error("Script update rejected: {0}")]
    UpdateRejected(String),

    /// Snapshot does not match the plan it is restored into.
    #[error("Snapshot mismatch: {0}")]
    SnapshotMismatch(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// The driver task ended abnormally.
    #[error("Run task failed: {0}")]
    Task(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Json(e.to_string())
    }
}

impl From<envy::Error> for EngineError {
    fn from(e: envy::Error) -> Self {
        EngineError::Configuration(e.to_string())
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        EngineError::Task(e.to_string())
    }
}

/// Reason code attached to a recoverable resource failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    /// Could not establish a connection.
    #[default]
    ConnectionError,
    /// The resource did not answer in time.
    Timeout,
    /// The resource answered with an error that may clear up on retry.
    ResourceUnavailable,
}

impl std::fmt::Display for FailoverReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionError => write!(f, "connection_error"),
            Self::Timeout => write!(f, "timeout"),
            Self::ResourceUnavailable => write!(f, "resource_unavailable"),
        }
    }
}

/// Recoverable failure of an external resource.
#[derive(Debug, Clone, Error)]
#[error("Resource '{resource}' failed ({reason}): {message}")]
pub struct FailoverError {
    pub resource: String,
    pub reason: FailoverReason,
    pub message: String,
}

impl FailoverError {
    pub fn new(resource: impl Into<String>, reason: FailoverReason, message: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            reason,
            message: message.into(),
        }
    }
}

/// Errors returned by action handlers.
#[derive(Debug, Error)]
pub enum ActionError {
    /// External resource failed; routed to the failover handshake.
    #[error(transparent)]
    Failover(#[from] FailoverError),

    /// Execution observed the run cancellation token.
    #[error("Action cancelled")]
    Cancelled,

    /// Ordinary failure with a message, recorded as a failed result.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Unexpected error, recorded as a crash.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors produced while evaluating formulas.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvalError {
    /// Expression references a value that does not exist.
    #[error("Unresolved reference in '{0}'")]
    Unresolved(String),

    /// Expression could not be parsed or evaluated.
    #[error("Evaluation error in '{expression}': {message}")]
    Syntax { expression: String, message: String },

    /// Expansion did not settle within the iteration ceiling.
    #[error("Formula '{0}' exceeds the expansion limit")]
    RecursionLimit(String),

    /// Embedded file content could not be loaded.
    #[error("Cannot load file '{path}': {message}")]
    File { path: String, message: String },

    /// Value is not a recognized boolean.
    #[error("Not a boolean value: '{0}'")]
    NotBoolean(String),
}

impl From<minijinja::Error> for EvalError {
    fn from(e: minijinja::Error) -> Self {
        match e.kind() {
            minijinja::ErrorKind::UndefinedError => {
                EvalError::Unresolved(e.detail().unwrap_or_default().to_string())
            }
            _ => EvalError::Syntax {
                expression: String::new(),
                message: e.to_string(),
            },
        }
    }
}

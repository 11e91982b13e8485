//! Matrix Engine
//!
//! Step-by-step execution scheduler for test automation scripts.
//!
//! This crate provides:
//! - Global steps that every script walks through in lockstep
//! - Synchronous and detached (async) action execution with join barriers
//! - Operator pause, continue and step replay
//! - Failover handshake for failing external resources
//! - Reference-counted lifetime of inter-action variables
//! - Run snapshots for resuming an interrupted run

pub mod action;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod expr;
pub mod plan;
pub mod report;
pub mod script;
pub mod snapshot;
pub mod step;
pub mod variables;

pub use action::{
    create_default_registry, Action, ActionHandler, ActionOutcome, ActionRegistry, ActionRequest,
    ActionResult, ActionSpec, FailReason, FlagExpr, Params, WaitAsyncEnd,
};
pub use config::EngineConfig;
pub use context::{ContextStore, ContextTier, ExecutionScope, RunContext, RunResource};
pub use engine::{
    CompletedRun, Engine, FailoverDecision, FailoverStatus, JoinScope, RunHandle, RunState,
    RunStatus,
};
pub use error::{ActionError, EngineError, EvalError, FailoverError, FailoverReason};
pub use expr::{ExpressionEvaluator, TemplateEvaluator};
pub use plan::RunPlan;
pub use report::{JsonLinesReportSink, MemoryReportSink, NoopReportSink, ReportSink};
pub use script::{Script, ScriptSpec};
pub use snapshot::{JsonFileSnapshotStore, RunSnapshot, SnapshotStore};
pub use step::{StartAtType, StepDef};

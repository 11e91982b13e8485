//! Actions: records, results and handlers.

pub mod builtin;
pub mod record;
pub mod registry;
pub mod result;

pub use builtin::create_default_registry;
pub use record::{Action, ActionSpec, FlagExpr, Params, ResolvedFlags, WaitAsyncEnd};
pub use registry::{default_join_scopes, ActionHandler, ActionOutcome, ActionRegistry, ActionRequest};
pub use result::{ActionResult, FailReason};

//! Built-in action kinds.
//!
//! - `SetStatic` - Publish parameters as outputs
//! - `Compare` - Verify that two values match
//! - `Sleep` - Pace execution by waiting
//! - `Pause` - Suspend the step until the operator continues

mod compare;
mod pause;
mod set_static;
mod sleep;

pub use self::compare::CompareAction;
pub use self::pause::PauseAction;
pub use self::set_static::SetStaticAction;
pub use self::sleep::SleepAction;

use crate::action::registry::ActionRegistry;

/// Create an action registry with all built-in actions registered.
pub fn create_default_registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();

    registry.register(SetStaticAction::new());
    registry.register(CompareAction::new());
    registry.register(SleepAction::new());
    registry.register(PauseAction::new());

    registry
}

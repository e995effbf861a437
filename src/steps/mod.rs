//! Built-in Step Behaviors
//!
//! The generic behaviors the engine ships with. Business-specific behaviors
//! (mail, identifiers, form filling) are registered by the host application
//! through [`StepRegistry::register`].
//!
//! | Type | Behavior |
//! |---|---|
//! | `start` | entry point, no action |
//! | `end` | optional removal from the workflow, update time, closing text |
//! | `condition` | evaluates an expression and forwards immediately |
//! | `wait`, `showdata` | interactive only |

pub mod condition;
pub mod end;
pub mod start;
pub mod wait;

pub use condition::{Condition, ConditionStep};
pub use end::EndStep;
pub use start::StartStep;
pub use wait::WaitStep;

use crate::execution::behavior::StepBehavior;
use crate::execution::registry::{RegistryError, StepRegistry};
use crate::workflow::Step;

fn boxed<B: StepBehavior + 'static>(behavior: B) -> Box<dyn StepBehavior> {
    Box::new(behavior)
}

/// Registers every built-in behavior.
pub fn register_builtin(registry: &mut StepRegistry) -> Result<(), RegistryError> {
    registry.register("start", |_: &Step| Ok(boxed(StartStep)))?;
    registry.register("end", |step: &Step| Ok(boxed(EndStep::from_step(step))))?;
    registry.register("condition", |step: &Step| {
        ConditionStep::from_step(step).map(boxed)
    })?;
    for name in ["wait", "showdata"] {
        registry.register(name, |_: &Step| Ok(boxed(WaitStep)))?;
    }
    Ok(())
}

//! Interactive holding step.

use crate::execution::behavior::StepBehavior;

/// Shows the item and waits for a person to pick a branch.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitStep;

impl StepBehavior for WaitStep {}

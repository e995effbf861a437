//! Entry step of a workflow.

use crate::execution::behavior::StepBehavior;

/// Holds newly entered items until someone submits them.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartStep;

impl StepBehavior for StartStep {}

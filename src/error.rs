//! Engine Error Taxonomy
//!
//! Every failure the engine can surface to a caller. Configuration errors
//! (unknown steps, missing branches, dangling references) are separated from
//! runtime behavior failures so the boundary can decide how to present them.

use thiserror::Error;

use crate::execution::registry::RegistryError;
use crate::store::{NodeId, StoreError};
use crate::workflow::transfer::TransferError;
use crate::workflow::validator::ValidationError;

/// Result alias used throughout the engine.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Errors raised by the transition engine and workflow administration.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The item is not contained by any step.
    #[error("item {item} is not in any workflow")]
    NotInWorkflow { item: NodeId },

    /// The branch selected by the outcome has no target.
    #[error("step '{step}' in workflow '{workflow}' has no {} transition", outcome_name(.outcome))]
    NoTransitionDefined {
        workflow: String,
        step: String,
        outcome: bool,
    },

    /// A step lookup by name or node found nothing. Definitions are
    /// validated whenever they are loaded, so an edge naming a missing step
    /// surfaces as [`ValidationError::UnknownTarget`] inside
    /// [`Validation`](Self::Validation) instead.
    #[error("workflow '{workflow}' has no step named '{step}'")]
    UnknownStep { workflow: String, step: String },

    #[error("workflow '{0}' does not exist")]
    UnknownWorkflow(String),

    #[error("workflow '{0}' already exists")]
    DuplicateWorkflow(String),

    /// A step behavior failed. The containment move has already been
    /// committed; the item stays in `step`.
    #[error("step '{step}' of workflow '{workflow}' failed for item {item} (outcome {outcome}): {message}")]
    BehaviorExecution {
        item: NodeId,
        workflow: String,
        step: String,
        outcome: bool,
        message: String,
    },

    #[error("workflow '{workflow}' already has a step named '{step}'")]
    DuplicateStepName { workflow: String, step: String },

    /// Removing or pointing at a step would leave an edge without target.
    #[error("step '{step}' is still referenced by {}", .referenced_by.join(", "))]
    DanglingReference {
        step: String,
        referenced_by: Vec<String>,
    },

    #[error("step '{step}' still contains {count} item(s)")]
    StepNotEmpty { step: String, count: usize },

    /// The item is held by more than one step at once.
    #[error("item {item} is contained by several workflow steps: {steps:?}")]
    ContainmentViolation { item: NodeId, steps: Vec<NodeId> },

    #[error("self-driving transition chain for item {item} exceeded {limit} steps")]
    TransitionChainTooLong { item: NodeId, limit: usize },

    #[error("permission denied")]
    PermissionDenied,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl WorkflowError {
    /// True for errors caused by workflow configuration rather than by the
    /// item or the caller. These are surfaced to an administrator.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::NoTransitionDefined { .. }
                | Self::UnknownStep { .. }
                | Self::UnknownWorkflow(_)
                | Self::Validation(_)
                | Self::Registry(_)
                | Self::TransitionChainTooLong { .. }
        )
    }
}

fn outcome_name(outcome: &bool) -> &'static str {
    if *outcome {
        "true"
    } else {
        "false"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_transition_message_names_branch() {
        let err = WorkflowError::NoTransitionDefined {
            workflow: "submission".to_string(),
            step: "end".to_string(),
            outcome: false,
        };
        assert!(err.to_string().contains("no false transition"));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_dangling_reference_lists_referrers() {
        let err = WorkflowError::DanglingReference {
            step: "review".to_string(),
            referenced_by: vec!["start".to_string(), "fix".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "step 'review' is still referenced by start, fix"
        );
    }

    #[test]
    fn test_not_in_workflow_is_not_configuration() {
        let err = WorkflowError::NotInWorkflow { item: 7 };
        assert!(!err.is_configuration_error());
        assert_eq!(err.to_string(), "item 7 is not in any workflow");
    }
}

//! Workflow Validation
//!
//! Provides validation for workflow graphs including:
//! - Step field validation
//! - Reference integrity (every edge names an existing step)
//! - Start step detection (exactly one step without incoming edges)
//! - Forward progress (every reachable step can reach a terminal step)
//! - Behavior resolution (every step type is registered and accepts its settings)
//!
//! Cycles are allowed; a workflow only has to guarantee that an item never
//! gets trapped in a region without exit.

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info, warn};
use thiserror::Error;

use crate::execution::behavior::StepBehavior;
use crate::execution::registry::{RegistryError, StepRegistry};

use super::model::{Step, WorkflowDefinition};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Workflow has an empty name")]
    EmptyWorkflowName,

    #[error("Workflow '{0}' has no steps")]
    EmptyWorkflow(String),

    #[error("Step has empty or whitespace-only name")]
    EmptyStepName,

    #[error("Duplicate step name: '{0}'")]
    DuplicateStepName(String),

    #[error("Step '{0}' has no type specified")]
    EmptyStepType(String),

    #[error("Step '{step}' uses unregistered step type '{step_type}'")]
    UnregisteredStepType { step: String, step_type: String },

    #[error("Step '{step}' has invalid settings: {message}")]
    InvalidSettings { step: String, message: String },

    #[error("Step '{step}' references unknown step '{target}'")]
    UnknownTarget { step: String, target: String },

    #[error("Workflow has no start step (every step has an incoming transition and none has type 'start')")]
    NoStartStep,

    #[error("Workflow has several start steps: {}", .0.join(", "))]
    MultipleStartSteps(Vec<String>),

    #[error("Steps can never reach a terminal step: {}", .0.join(", "))]
    NoTerminalReachable(Vec<String>),

    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<ValidationError>),
}

impl ValidationError {
    fn from_list(mut errors: Vec<ValidationError>) -> Result<(), ValidationError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ValidationError::Multiple(errors)),
        }
    }
}

/// Validates a single step's fields.
fn validate_step(step: &Step) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.name.trim().is_empty() {
        errors.push(ValidationError::EmptyStepName);
        return errors; // Can't validate further without a name
    }

    if step.step_type.trim().is_empty() {
        errors.push(ValidationError::EmptyStepType(step.name.clone()));
    }

    for outcome in [true, false] {
        let edge = step.edge(outcome);
        if edge.target().is_some() && edge.label.is_empty() && edge.labels.is_empty() {
            debug!(
                "Step '{}': {} branch has no label and is only taken by the step itself",
                step.name, outcome
            );
        }
    }

    errors
}

/// Validates the structure of a workflow without resolving behaviors.
///
/// Performs the following checks:
/// 1. Workflow has a name and at least one step
/// 2. No duplicate step names
/// 3. All steps have valid fields
/// 4. All edges point to existing steps
/// 5. Exactly one start step
/// 6. Every step reachable from the start can reach a terminal step
pub fn validate_structure(workflow: &WorkflowDefinition) -> Result<(), ValidationError> {
    if workflow.name.trim().is_empty() {
        return Err(ValidationError::EmptyWorkflowName);
    }

    if workflow.steps.is_empty() {
        return Err(ValidationError::EmptyWorkflow(workflow.name.clone()));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if !seen.insert(step.name.as_str()) {
            return Err(ValidationError::DuplicateStepName(step.name.clone()));
        }
    }

    let mut all_errors = Vec::new();
    for step in &workflow.steps {
        all_errors.extend(validate_step(step));

        for target in step.successors() {
            if !seen.contains(target) {
                all_errors.push(ValidationError::UnknownTarget {
                    step: step.name.clone(),
                    target: target.to_string(),
                });
            }
        }
    }
    ValidationError::from_list(all_errors)?;

    let start = workflow.start_step()?;
    check_forward_progress(workflow, start)?;

    Ok(())
}

/// Validates a workflow and resolves every step type against the registry.
///
/// This is the check run whenever a definition is loaded, created, edited or
/// imported, so that configuration errors surface before any item moves.
pub fn validate_definition(
    workflow: &WorkflowDefinition,
    registry: &StepRegistry,
) -> Result<(), ValidationError> {
    info!(
        "Validating workflow '{}' with {} steps",
        workflow.name,
        workflow.steps.len()
    );

    validate_structure(workflow)?;
    resolve_behaviors(workflow, registry)?;

    info!("Workflow '{}' validated", workflow.name);
    Ok(())
}

/// Instantiates the behavior of every step through the registry.
///
/// Fails with a named error for the first unregistered type or rejected
/// settings block, so a broken definition never reaches the engine.
pub fn resolve_behaviors(
    workflow: &WorkflowDefinition,
    registry: &StepRegistry,
) -> Result<HashMap<String, Box<dyn StepBehavior>>, ValidationError> {
    let mut behaviors = HashMap::new();
    let mut all_errors = Vec::new();

    for step in &workflow.steps {
        match registry.instantiate(step) {
            Ok(behavior) => {
                behaviors.insert(step.name.clone(), behavior);
            }
            Err(RegistryError::UnknownStepType(step_type)) => {
                all_errors.push(ValidationError::UnregisteredStepType {
                    step: step.name.clone(),
                    step_type,
                });
            }
            Err(other) => all_errors.push(ValidationError::InvalidSettings {
                step: step.name.clone(),
                message: other.to_string(),
            }),
        }
    }
    ValidationError::from_list(all_errors)?;

    Ok(behaviors)
}

/// Checks that no reachable step is trapped in a region without exit.
fn check_forward_progress(workflow: &WorkflowDefinition, start: &Step) -> Result<(), ValidationError> {
    // Forward reachability from the start step
    let mut reachable: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([start.name.as_str()]);
    while let Some(current) = queue.pop_front() {
        if !reachable.insert(current) {
            continue;
        }
        if let Some(step) = workflow.get_step(current) {
            queue.extend(step.successors());
        }
    }

    for step in &workflow.steps {
        if !reachable.contains(step.name.as_str()) {
            warn!(
                "Step '{}' in workflow '{}' is not reachable from start step '{}'",
                step.name, workflow.name, start.name
            );
        }
    }

    // Reverse reachability from terminal steps
    let mut predecessors: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &workflow.steps {
        for target in step.successors() {
            predecessors.entry(target).or_default().push(step.name.as_str());
        }
    }

    let mut can_finish: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = workflow
        .steps
        .iter()
        .filter(|s| s.is_terminal())
        .map(|s| s.name.as_str())
        .collect();
    while let Some(current) = queue.pop_front() {
        if !can_finish.insert(current) {
            continue;
        }
        if let Some(preds) = predecessors.get(current) {
            queue.extend(preds.iter().copied());
        }
    }

    let mut trapped: Vec<String> = workflow
        .steps
        .iter()
        .map(|s| s.name.as_str())
        .filter(|name| reachable.contains(name) && !can_finish.contains(name))
        .map(str::to_string)
        .collect();

    if trapped.is_empty() {
        Ok(())
    } else {
        trapped.sort();
        Err(ValidationError::NoTerminalReachable(trapped))
    }
}

/// Quick validation that returns a list of error messages.
///
/// Useful for administrative feedback: unlike [`validate_definition`] it
/// keeps going after the first failing check.
pub fn quick_validate(workflow: &WorkflowDefinition, registry: Option<&StepRegistry>) -> Vec<String> {
    let mut errors = Vec::new();

    if workflow.steps.is_empty() {
        errors.push(ValidationError::EmptyWorkflow(workflow.name.clone()).to_string());
        return errors;
    }

    let names: HashSet<&str> = workflow.steps.iter().map(|s| s.name.as_str()).collect();

    for step in &workflow.steps {
        errors.extend(validate_step(step).iter().map(|e| e.to_string()));

        for target in step.successors() {
            if !names.contains(target) {
                errors.push(format!(
                    "Step '{}': references unknown step '{}'",
                    step.name, target
                ));
            }
        }

        if let Some(registry) = registry {
            if !registry.contains(&step.step_type) {
                errors.push(format!(
                    "Step '{}': unregistered step type '{}'",
                    step.name, step.step_type
                ));
            }
        }
    }

    if let Err(e) = workflow.start_step() {
        errors.push(e.to_string());
    }

    errors
}

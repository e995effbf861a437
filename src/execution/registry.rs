//! Step Registry
//!
//! Maps step type names to behavior factories. A registry is built once at
//! process start and handed to the engine; nothing registers itself
//! implicitly.
//!
//! # Example
//!
//! ```
//! use docflow::execution::StepRegistry;
//! use docflow::workflow::Step;
//!
//! let registry = StepRegistry::with_builtin_steps().unwrap();
//! assert!(registry.contains("workflowstep-condition"));
//! assert!(registry.instantiate(&Step::new("done", "end")).is_ok());
//! ```

use std::collections::{BTreeMap, HashMap};

use log::debug;
use thiserror::Error;

use crate::error::{WorkflowError, WorkflowResult};
use crate::workflow::model::{Step, WorkflowDefinition};
use crate::workflow::validator::{resolve_behaviors, validate_structure, ValidationError};

use super::behavior::StepBehavior;

/// Builds the behavior for one step from its settings.
///
/// Returning `Err` rejects the step's settings at load time.
pub type BehaviorFactory =
    Box<dyn Fn(&Step) -> Result<Box<dyn StepBehavior>, String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("step type '{0}' is registered twice")]
    DuplicateStepType(String),

    #[error("step type '{0}' is not registered")]
    UnknownStepType(String),

    #[error("step type '{step_type}' rejected its settings: {message}")]
    InvalidSettings { step_type: String, message: String },
}

/// Strips the legacy `workflowstep-` / `workflowstep_` prefix.
pub fn canonical_type_name(name: &str) -> &str {
    let name = name.trim();
    name.strip_prefix("workflowstep-")
        .or_else(|| name.strip_prefix("workflowstep_"))
        .unwrap_or(name)
}

/// Read-mostly mapping from type name to behavior factory.
#[derive(Default)]
pub struct StepRegistry {
    factories: BTreeMap<String, BehaviorFactory>,
}

impl StepRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in behaviors.
    pub fn with_builtin_steps() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        crate::steps::register_builtin(&mut registry)?;
        Ok(registry)
    }

    /// Registers a factory under a type name.
    ///
    /// Registering the same (canonical) name twice is an error; callers are
    /// expected to treat it as fatal during startup.
    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&Step) -> Result<Box<dyn StepBehavior>, String> + Send + Sync + 'static,
    {
        let name = canonical_type_name(name).to_string();
        if self.factories.contains_key(&name) {
            return Err(RegistryError::DuplicateStepType(name));
        }
        debug!("Registered step type '{}'", name);
        self.factories.insert(name, Box::new(factory));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(canonical_type_name(name))
    }

    /// Registered type names in sorted order.
    pub fn type_names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Builds the behavior for a step.
    pub fn instantiate(&self, step: &Step) -> Result<Box<dyn StepBehavior>, RegistryError> {
        let name = canonical_type_name(&step.step_type);
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RegistryError::UnknownStepType(step.step_type.clone()))?;

        factory(step).map_err(|message| RegistryError::InvalidSettings {
            step_type: name.to_string(),
            message,
        })
    }
}

/// A workflow definition with every step's behavior resolved.
///
/// Binding happens once per load; the behaviors never change afterwards.
pub struct BoundWorkflow {
    definition: WorkflowDefinition,
    behaviors: HashMap<String, Box<dyn StepBehavior>>,
}

impl BoundWorkflow {
    /// Validates the definition and resolves its behaviors.
    pub fn bind(
        definition: WorkflowDefinition,
        registry: &StepRegistry,
    ) -> Result<Self, ValidationError> {
        validate_structure(&definition)?;
        let behaviors = resolve_behaviors(&definition, registry)?;
        Ok(Self {
            definition,
            behaviors,
        })
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn behavior(&self, step: &str) -> WorkflowResult<&dyn StepBehavior> {
        self.behaviors
            .get(step)
            .map(|b| b.as_ref())
            .ok_or_else(|| WorkflowError::UnknownStep {
                workflow: self.definition.name.clone(),
                step: step.to_string(),
            })
    }
}

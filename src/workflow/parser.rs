//! Workflow Parser
//!
//! Loads and saves single workflow definitions as YAML files. The loaded
//! definition is validated against a step registry, so a file naming an
//! unregistered step type fails here rather than when an item reaches the
//! step.

use std::error::Error;
use std::fs;

use log::{debug, info};

use crate::execution::registry::StepRegistry;

use super::model::WorkflowDefinition;
use super::validator::validate_definition;

/// Parses a workflow definition from YAML text without validating it.
pub fn parse_definition(yaml: &str) -> Result<WorkflowDefinition, Box<dyn Error>> {
    let definition: WorkflowDefinition = serde_yaml::from_str(yaml).map_err(|e| {
        format!(
            "Failed to parse workflow YAML: {}. Check the file format.",
            e
        )
    })?;
    Ok(definition)
}

/// Loads a workflow definition from a YAML file.
///
/// This function:
/// 1. Reads and parses the YAML file
/// 2. Validates the graph structure
/// 3. Resolves every step type against the registry
///
/// # Example
///
/// ```rust,no_run
/// use docflow::execution::StepRegistry;
/// use docflow::workflow::load_definition;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let registry = StepRegistry::with_builtin_steps()?;
///     let workflow = load_definition("submission.yaml", &registry)?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_definition(
    path: &str,
    registry: &StepRegistry,
) -> Result<WorkflowDefinition, Box<dyn Error>> {
    info!("Loading workflow from: {}", path);

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path, e
        )
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    let definition = parse_definition(&yaml_content)?;
    info!(
        "Parsed workflow '{}' with {} steps",
        definition.name,
        definition.steps.len()
    );

    validate_definition(&definition, registry)?;

    Ok(definition)
}

/// Saves a workflow definition to a YAML file.
pub fn save_definition(definition: &WorkflowDefinition, path: &str) -> Result<(), Box<dyn Error>> {
    let yaml_content = serde_yaml::to_string(definition)?;
    fs::write(path, yaml_content)?;
    info!("Workflow '{}' saved to: {}", definition.name, path);
    Ok(())
}

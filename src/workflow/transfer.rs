//! Workflow Export and Import
//!
//! Serializes whole workflow definitions (steps, settings, edges, access
//! rules) into a single JSON or YAML document, and re-creates them from such
//! a document under new names.
//!
//! Some step settings hold identifiers of other store nodes (an export
//! mapping, a mapping field). Those nodes travel inside the document and are
//! re-created on import; the settings are rewritten to point at the new
//! nodes, never at the identifiers of the exporting system.
//!
//! # Document Layout
//!
//! ```yaml
//! version: 1
//! exported: 2024-05-01T12:00:00
//! workflows:
//!   - name: submission
//!     steps: [...]
//! references:
//!   - id: 42
//!     name: marc21
//!     node_type: mapping
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Local;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{WorkflowError, WorkflowResult};
use crate::execution::engine::TIME_FORMAT;
use crate::store::{ContentStore, NodeId};

use super::model::WorkflowDefinition;
use super::repository::{self, insert_workflow, WorkflowRepository};

/// Current document version.
pub const EXPORT_VERSION: u32 = 1;

/// Step settings whose values are identifiers of other nodes.
pub const REFERENCE_SETTINGS: &[&str] = &["exportmapping", "mappingfield", "mapping"];

/// Root under which imported referenced nodes are created.
pub const REFERENCES_ROOT: &str = "mappings";

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to parse export document: {0}")]
    Parse(String),

    #[error("failed to serialize export document: {0}")]
    Serialize(String),

    #[error("unsupported export document version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("export document contains no workflows")]
    Empty,

    #[error("a target name can only be given when importing a single workflow, document has {0}")]
    AmbiguousName(usize),

    #[error("step '{step}' of workflow '{workflow}' references node {id} in '{key}', which is not part of the document")]
    UnresolvedReference {
        workflow: String,
        step: String,
        key: String,
        id: NodeId,
    },
}

/// Serialization format of an export document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
}

impl Format {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }
}

/// A node referenced from step settings, carried along with the export.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExportedNode {
    /// Identifier in the exporting system
    pub id: NodeId,
    pub name: String,
    pub node_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExportDocument {
    pub version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub exported: String,
    pub workflows: Vec<WorkflowDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ExportedNode>,
}

impl ExportDocument {
    pub fn to_text(&self, format: Format) -> Result<String, TransferError> {
        match format {
            Format::Json => serde_json::to_string_pretty(self)
                .map_err(|e| TransferError::Serialize(e.to_string())),
            Format::Yaml => {
                serde_yaml::to_string(self).map_err(|e| TransferError::Serialize(e.to_string()))
            }
        }
    }

    /// Parses a document, detecting JSON by its leading brace.
    pub fn parse(text: &str) -> Result<Self, TransferError> {
        let document: ExportDocument = if text.trim_start().starts_with('{') {
            serde_json::from_str(text).map_err(|e| TransferError::Parse(e.to_string()))?
        } else {
            serde_yaml::from_str(text).map_err(|e| TransferError::Parse(e.to_string()))?
        };

        if document.version != EXPORT_VERSION {
            return Err(TransferError::UnsupportedVersion {
                found: document.version,
                expected: EXPORT_VERSION,
            });
        }
        Ok(document)
    }
}

fn is_separator(c: char) -> bool {
    c == ';' || c == ',' || c.is_whitespace()
}

/// Numeric identifiers in a reference setting value.
fn reference_ids(value: &str) -> Vec<NodeId> {
    value
        .split(is_separator)
        .filter_map(|token| token.parse().ok())
        .collect()
}

/// Rewrites numeric tokens of a reference value through `map`, keeping the
/// separators intact.
fn remap_value(value: &str, map: &HashMap<NodeId, NodeId>) -> Result<String, NodeId> {
    let mut result = String::with_capacity(value.len());
    let mut token = String::new();

    let flush = |token: &mut String, result: &mut String| -> Result<(), NodeId> {
        if let Ok(id) = token.parse::<NodeId>() {
            let new_id = map.get(&id).ok_or(id)?;
            result.push_str(&new_id.to_string());
        } else {
            result.push_str(token);
        }
        token.clear();
        Ok(())
    };

    for c in value.chars() {
        if is_separator(c) {
            flush(&mut token, &mut result)?;
            result.push(c);
        } else {
            token.push(c);
        }
    }
    flush(&mut token, &mut result)?;
    Ok(result)
}

/// Exports the named workflows, or every workflow when `names` is empty.
pub fn export_workflows(store: &dyn ContentStore, names: &[&str]) -> WorkflowResult<ExportDocument> {
    let mut workflows = if names.is_empty() {
        repository::list_workflows(store)?
    } else {
        names
            .iter()
            .map(|name| repository::load_by_name(store, name))
            .collect::<WorkflowResult<Vec<_>>>()?
    };

    // Node ids are meaningless outside this store
    for workflow in &mut workflows {
        workflow.node = None;
        for step in &mut workflow.steps {
            step.node = None;
        }
    }

    let mut referenced = BTreeSet::new();
    for workflow in &workflows {
        for step in &workflow.steps {
            for key in REFERENCE_SETTINGS {
                referenced.extend(reference_ids(step.setting(key)));
            }
        }
    }

    let mut references = Vec::new();
    for id in referenced {
        let node = store.node(id)?;
        references.push(ExportedNode {
            id,
            name: node.name,
            node_type: node.node_type,
            attributes: node.attributes,
        });
    }

    info!(
        "Exported {} workflow(s) with {} referenced node(s)",
        workflows.len(),
        references.len()
    );

    Ok(ExportDocument {
        version: EXPORT_VERSION,
        exported: Local::now().format(TIME_FORMAT).to_string(),
        workflows,
        references,
    })
}

/// Imports every workflow of a document.
///
/// Without `name` each workflow is created as `import-<name>`. A name may
/// only be given for single-workflow documents. Either everything is
/// imported or nothing is. Returns the names of the created workflows.
pub fn import_document(
    repo: &WorkflowRepository,
    store: &mut dyn ContentStore,
    document: &ExportDocument,
    name: Option<&str>,
) -> WorkflowResult<Vec<String>> {
    if document.workflows.is_empty() {
        return Err(TransferError::Empty.into());
    }
    if name.is_some() && document.workflows.len() > 1 {
        return Err(TransferError::AmbiguousName(document.workflows.len()).into());
    }

    repo.transaction(store, |store| {
        let mut id_map = HashMap::new();
        if !document.references.is_empty() {
            let root = store.root(REFERENCES_ROOT)?;
            for exported in &document.references {
                let id = store.create_node(&exported.name, &exported.node_type)?;
                store.append_child(root, id)?;
                for (key, value) in &exported.attributes {
                    store.set(id, key, value)?;
                }
                debug!("Re-created referenced node {} as {}", exported.id, id);
                id_map.insert(exported.id, id);
            }
        }

        let mut created = Vec::new();
        for source in &document.workflows {
            let mut definition = source.clone();
            definition.name = match name {
                Some(name) => name.trim().to_string(),
                None => format!("import-{}", source.name),
            };
            definition.node = None;

            for step in &mut definition.steps {
                step.node = None;
                for key in REFERENCE_SETTINGS {
                    let Some(value) = step.settings.get_mut(*key) else {
                        continue;
                    };
                    *value = remap_value(value, &id_map).map_err(|id| {
                        WorkflowError::from(TransferError::UnresolvedReference {
                            workflow: source.name.clone(),
                            step: step.name.clone(),
                            key: key.to_string(),
                            id,
                        })
                    })?;
                }
            }

            insert_workflow(store, &definition, repo.registry())?;
            info!("Imported workflow '{}' as '{}'", source.name, definition.name);
            created.push(definition.name);
        }
        Ok(created)
    })
}

//! Workflow Repository
//!
//! Maps [`WorkflowDefinition`]s onto the content tree and back.
//!
//! # Tree Layout
//!
//! ```text
//! workflows                      (root)
//! └── submission                 (workflow)   description, access.*
//!     ├── start                  (workflowstep)
//!     ├── review                 (workflowstep)
//!     │   └── thesis.pdf         (any item type: contained = in this step)
//!     └── end                    (workflowstep)
//! ```
//!
//! Step nodes carry `steptype`, `truestep`, `falsestep`, `truelabel`,
//! `truelabel.<lang>`, `falselabel`, `falselabel.<lang>`, `comment`,
//! `access.<capability>` and one `setting:<key>` attribute per setting.
//!
//! Reads are plain functions over a store session. Mutations go through
//! [`WorkflowRepository`], which validates, takes the concurrency guard and
//! commits or rolls back as a unit.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;

use crate::access::Capability;
use crate::error::{WorkflowError, WorkflowResult};
use crate::execution::engine::{ERROR_ATTR, ERROR_STEP_ATTR, ERROR_TIME_ATTR};
use crate::execution::guard::ConcurrencyGuard;
use crate::execution::registry::StepRegistry;
use crate::store::{ContentStore, Node, NodeId};

use super::model::{
    AccessRules, Edge, Step, WorkflowDefinition, STEP_NODE_TYPE, WORKFLOWS_ROOT,
    WORKFLOW_NODE_TYPE,
};
use super::validator::validate_definition;

const STEP_TYPE_KEY: &str = "steptype";
const TRUE_STEP_KEY: &str = "truestep";
const FALSE_STEP_KEY: &str = "falsestep";
const TRUE_LABEL_KEY: &str = "truelabel";
const FALSE_LABEL_KEY: &str = "falselabel";
const COMMENT_KEY: &str = "comment";
const DESCRIPTION_KEY: &str = "description";
const SETTING_PREFIX: &str = "setting:";

/// An item as listed in a step or a search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemSummary {
    pub id: NodeId,
    pub name: String,
    pub node_type: String,
    pub creation_time: String,
    pub workflow: String,
    pub step: String,
}

/// An item whose last step action failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedItem {
    pub item: ItemSummary,
    pub error: String,
    pub error_step: String,
    pub error_time: String,
}

// ---------------------------------------------------------------------------
// Attribute encoding
// ---------------------------------------------------------------------------

fn access_attributes(rules: &AccessRules, attributes: &mut BTreeMap<String, String>) {
    for capability in Capability::ALL {
        let ruleset = rules.get(capability);
        if !ruleset.is_empty() {
            attributes.insert(capability.attribute_key(), ruleset.to_string());
        }
    }
}

fn access_from_node(node: &Node) -> AccessRules {
    let mut rules = AccessRules::default();
    for capability in Capability::ALL {
        rules.set(capability, node.get(&capability.attribute_key()));
    }
    rules
}

fn edge_attributes(
    edge: &Edge,
    target_key: &str,
    label_key: &str,
    attributes: &mut BTreeMap<String, String>,
) {
    if !edge.target.is_empty() {
        attributes.insert(target_key.to_string(), edge.target.clone());
    }
    if !edge.label.is_empty() {
        attributes.insert(label_key.to_string(), edge.label.clone());
    }
    for (language, label) in &edge.labels {
        attributes.insert(format!("{}.{}", label_key, language), label.clone());
    }
}

fn edge_from_node(node: &Node, target_key: &str, label_key: &str) -> Edge {
    let localized_prefix = format!("{}.", label_key);
    Edge {
        target: node.get(target_key).to_string(),
        label: node.get(label_key).to_string(),
        labels: node
            .attributes
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&localized_prefix)
                    .map(|language| (language.to_string(), value.clone()))
            })
            .collect(),
    }
}

/// Attribute map stored on a step node.
pub fn step_attributes(step: &Step) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    attributes.insert(STEP_TYPE_KEY.to_string(), step.step_type.clone());
    edge_attributes(&step.true_edge, TRUE_STEP_KEY, TRUE_LABEL_KEY, &mut attributes);
    edge_attributes(&step.false_edge, FALSE_STEP_KEY, FALSE_LABEL_KEY, &mut attributes);
    if !step.comment.is_empty() {
        attributes.insert(COMMENT_KEY.to_string(), step.comment.clone());
    }
    access_attributes(&step.access, &mut attributes);
    for (key, value) in &step.settings {
        attributes.insert(format!("{}{}", SETTING_PREFIX, key), value.clone());
    }
    attributes
}

/// Rebuilds a step from its node.
pub fn step_from_node(node: &Node) -> Step {
    let mut step = Step::new(node.name.clone(), node.get(STEP_TYPE_KEY));
    step.true_edge = edge_from_node(node, TRUE_STEP_KEY, TRUE_LABEL_KEY);
    step.false_edge = edge_from_node(node, FALSE_STEP_KEY, FALSE_LABEL_KEY);
    step.comment = node.get(COMMENT_KEY).to_string();
    step.access = access_from_node(node);
    step.settings = node
        .attributes
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(SETTING_PREFIX)
                .map(|setting| (setting.to_string(), value.clone()))
        })
        .collect();
    step.node = Some(node.id);
    step
}

fn workflow_attributes(definition: &WorkflowDefinition) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    if !definition.description.is_empty() {
        attributes.insert(DESCRIPTION_KEY.to_string(), definition.description.clone());
    }
    access_attributes(&definition.access, &mut attributes);
    attributes
}

/// Makes the node's attributes equal to `attributes`.
fn write_attributes(
    store: &mut dyn ContentStore,
    id: NodeId,
    attributes: &BTreeMap<String, String>,
) -> WorkflowResult<()> {
    let existing = store.node(id)?.attributes;
    for key in existing.keys() {
        if !attributes.contains_key(key) {
            store.unset(id, key)?;
        }
    }
    for (key, value) in attributes {
        if existing.get(key) != Some(value) {
            store.set(id, key, value)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Node ids of all workflows, in creation order.
pub fn workflow_nodes(store: &dyn ContentStore) -> WorkflowResult<Vec<NodeId>> {
    let Some(root) = store.find_root(WORKFLOWS_ROOT)? else {
        return Ok(Vec::new());
    };
    let mut result = Vec::new();
    for child in store.children(root)? {
        if store.node(child)?.node_type == WORKFLOW_NODE_TYPE {
            result.push(child);
        }
    }
    Ok(result)
}

pub fn find_workflow(store: &dyn ContentStore, name: &str) -> WorkflowResult<Option<NodeId>> {
    let Some(root) = store.find_root(WORKFLOWS_ROOT)? else {
        return Ok(None);
    };
    match store.child_named(root, name)? {
        Some(id) if store.node(id)?.node_type == WORKFLOW_NODE_TYPE => Ok(Some(id)),
        _ => Ok(None),
    }
}

/// Reads a workflow definition from its node.
pub fn load_definition(
    store: &dyn ContentStore,
    workflow_node: NodeId,
) -> WorkflowResult<WorkflowDefinition> {
    let node = store.node(workflow_node)?;
    if node.node_type != WORKFLOW_NODE_TYPE {
        return Err(WorkflowError::UnknownWorkflow(format!(
            "#{} ({})",
            workflow_node, node.node_type
        )));
    }

    let mut definition = WorkflowDefinition::new(node.name.clone());
    definition.description = node.get(DESCRIPTION_KEY).to_string();
    definition.access = access_from_node(&node);
    definition.node = Some(workflow_node);

    for child in &node.children {
        let child = store.node(*child)?;
        if child.node_type == STEP_NODE_TYPE {
            definition.steps.push(step_from_node(&child));
        }
    }

    debug!(
        "Loaded workflow '{}' ({} steps) from node {}",
        definition.name,
        definition.steps.len(),
        workflow_node
    );
    Ok(definition)
}

pub fn load_by_name(store: &dyn ContentStore, name: &str) -> WorkflowResult<WorkflowDefinition> {
    let node = find_workflow(store, name)?
        .ok_or_else(|| WorkflowError::UnknownWorkflow(name.to_string()))?;
    load_definition(store, node)
}

/// All workflow definitions.
pub fn list_workflows(store: &dyn ContentStore) -> WorkflowResult<Vec<WorkflowDefinition>> {
    workflow_nodes(store)?
        .into_iter()
        .map(|id| load_definition(store, id))
        .collect()
}

fn step_nodes(store: &dyn ContentStore, workflow_node: NodeId) -> WorkflowResult<Vec<NodeId>> {
    let mut result = Vec::new();
    for child in store.children(workflow_node)? {
        if store.node(child)?.node_type == STEP_NODE_TYPE {
            result.push(child);
        }
    }
    Ok(result)
}

fn summarize(item: &Node, workflow: &str, step: &str) -> ItemSummary {
    ItemSummary {
        id: item.id,
        name: item.name.clone(),
        node_type: item.node_type.clone(),
        creation_time: item.get("creationtime").to_string(),
        workflow: workflow.to_string(),
        step: step.to_string(),
    }
}

/// Items currently held by a step, sorted by name.
pub fn step_items(store: &dyn ContentStore, step_node: NodeId) -> WorkflowResult<Vec<ItemSummary>> {
    let step = store.node(step_node)?;
    let workflow = match store
        .containing_parents(step_node, WORKFLOW_NODE_TYPE)?
        .first()
    {
        Some(id) => store.node(*id)?.name,
        None => String::new(),
    };

    let mut items = Vec::new();
    for child in &step.children {
        items.push(summarize(&store.node(*child)?, &workflow, &step.name));
    }
    items.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
    Ok(items)
}

/// Items in any step of a workflow, grouped by step order.
pub fn workflow_items(
    store: &dyn ContentStore,
    workflow_node: NodeId,
) -> WorkflowResult<Vec<ItemSummary>> {
    let mut items = Vec::new();
    for step in step_nodes(store, workflow_node)? {
        items.extend(step_items(store, step)?);
    }
    Ok(items)
}

/// Items of a workflow carrying an error record.
pub fn failed_items(
    store: &dyn ContentStore,
    workflow_node: NodeId,
) -> WorkflowResult<Vec<FailedItem>> {
    let mut failed = Vec::new();
    for summary in workflow_items(store, workflow_node)? {
        let node = store.node(summary.id)?;
        if node.get(ERROR_ATTR).is_empty() {
            continue;
        }
        failed.push(FailedItem {
            error: node.get(ERROR_ATTR).to_string(),
            error_step: node.get(ERROR_STEP_ATTR).to_string(),
            error_time: node.get(ERROR_TIME_ATTR).to_string(),
            item: summary,
        });
    }
    Ok(failed)
}

/// Searches the items of the given workflows.
///
/// `*` matches everything, a number matches the item id, anything else is
/// a case-insensitive substring of the item name or any attribute value.
pub fn search_items(
    store: &dyn ContentStore,
    workflows: &[NodeId],
    query: &str,
) -> WorkflowResult<Vec<ItemSummary>> {
    let query = query.trim();
    let needle = query.to_lowercase();
    let id_query: Option<NodeId> = query.parse().ok();

    let mut result = Vec::new();
    for workflow in workflows {
        for summary in workflow_items(store, *workflow)? {
            let matches = if query == "*" {
                true
            } else if let Some(id) = id_query {
                summary.id == id
            } else if needle.is_empty() {
                false
            } else {
                let node = store.node(summary.id)?;
                node.name.to_lowercase().contains(&needle)
                    || node
                        .attributes
                        .values()
                        .any(|v| v.to_lowercase().contains(&needle))
            };
            if matches {
                result.push(summary);
            }
        }
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// Writes a new workflow and its steps. Does not lock or commit.
pub(crate) fn insert_workflow(
    store: &mut dyn ContentStore,
    definition: &WorkflowDefinition,
    registry: &StepRegistry,
) -> WorkflowResult<NodeId> {
    validate_definition(definition, registry)?;

    if find_workflow(store, &definition.name)?.is_some() {
        return Err(WorkflowError::DuplicateWorkflow(definition.name.clone()));
    }

    let root = store.root(WORKFLOWS_ROOT)?;
    let workflow_node = store.create_node(&definition.name, WORKFLOW_NODE_TYPE)?;
    store.append_child(root, workflow_node)?;
    write_attributes(store, workflow_node, &workflow_attributes(definition))?;

    for step in &definition.steps {
        let step_node = store.create_node(&step.name, STEP_NODE_TYPE)?;
        store.append_child(workflow_node, step_node)?;
        write_attributes(store, step_node, &step_attributes(step))?;
    }

    info!(
        "Created workflow '{}' with {} steps (node {})",
        definition.name,
        definition.steps.len(),
        workflow_node
    );
    Ok(workflow_node)
}

/// Administrative edits of workflow definitions.
///
/// Every mutation validates the resulting definition, runs under the
/// concurrency guard and commits as a unit; on error nothing is written.
#[derive(Clone)]
pub struct WorkflowRepository {
    registry: Arc<StepRegistry>,
    guard: ConcurrencyGuard,
}

impl WorkflowRepository {
    pub fn new(registry: Arc<StepRegistry>, guard: ConcurrencyGuard) -> Self {
        Self { registry, guard }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Runs `f` under the guard on a freshly rebased session, committing on
    /// success and rolling back on error.
    pub(crate) fn transaction<T>(
        &self,
        store: &mut dyn ContentStore,
        f: impl FnOnce(&mut dyn ContentStore) -> WorkflowResult<T>,
    ) -> WorkflowResult<T> {
        let _lock = self.guard.acquire();
        store.refresh()?;
        let result = f(&mut *store).and_then(|value| {
            store.commit()?;
            Ok(value)
        });
        if result.is_err() {
            store.rollback();
        }
        result
    }

    /// Creates a new workflow from a definition.
    pub fn create(
        &self,
        store: &mut dyn ContentStore,
        definition: WorkflowDefinition,
    ) -> WorkflowResult<NodeId> {
        self.transaction(store, |store| {
            insert_workflow(store, &definition, &self.registry)
        })
    }

    /// Writes an edited definition back to its nodes.
    ///
    /// The definition must have been loaded from the store. Steps keep their
    /// nodes across renames, so items stay where they are. Steps missing from
    /// the definition are deleted unless they still hold items.
    pub fn save(
        &self,
        store: &mut dyn ContentStore,
        definition: &WorkflowDefinition,
    ) -> WorkflowResult<()> {
        self.transaction(store, |store| self.save_unlocked(store, definition))
    }

    fn save_unlocked(
        &self,
        store: &mut dyn ContentStore,
        definition: &WorkflowDefinition,
    ) -> WorkflowResult<()> {
        let workflow_node = definition
            .node
            .ok_or_else(|| WorkflowError::UnknownWorkflow(definition.name.clone()))?;
        validate_definition(definition, &self.registry)?;

        let current = store.node(workflow_node)?;
        if current.node_type != WORKFLOW_NODE_TYPE {
            return Err(WorkflowError::UnknownWorkflow(definition.name.clone()));
        }
        if current.name != definition.name {
            if find_workflow(store, &definition.name)?.is_some() {
                return Err(WorkflowError::DuplicateWorkflow(definition.name.clone()));
            }
            info!("Renaming workflow '{}' to '{}'", current.name, definition.name);
            store.rename(workflow_node, &definition.name)?;
        }
        write_attributes(store, workflow_node, &workflow_attributes(definition))?;

        let existing = step_nodes(store, workflow_node)?;
        let kept: HashSet<NodeId> = definition.steps.iter().filter_map(|s| s.node).collect();

        for step_node in existing.iter().filter(|id| !kept.contains(id)) {
            let node = store.node(*step_node)?;
            if !node.children.is_empty() {
                return Err(WorkflowError::StepNotEmpty {
                    step: node.name,
                    count: node.children.len(),
                });
            }
            store.delete_node(*step_node)?;
            info!("Deleted step '{}' of workflow '{}'", node.name, definition.name);
        }

        for step in &definition.steps {
            let step_node = match step.node {
                Some(id) if existing.contains(&id) => {
                    if store.node(id)?.name != step.name {
                        store.rename(id, &step.name)?;
                    }
                    id
                }
                Some(id) => {
                    return Err(WorkflowError::UnknownStep {
                        workflow: definition.name.clone(),
                        step: format!("{} (node {} belongs elsewhere)", step.name, id),
                    })
                }
                None => {
                    let id = store.create_node(&step.name, STEP_NODE_TYPE)?;
                    store.append_child(workflow_node, id)?;
                    debug!("Added step '{}' to workflow '{}'", step.name, definition.name);
                    id
                }
            };
            write_attributes(store, step_node, &step_attributes(step))?;
        }

        info!("Saved workflow '{}'", definition.name);
        Ok(())
    }

    /// Deletes a workflow. Items still in its steps are detached first and
    /// are no longer in any workflow afterwards. Returns how many were
    /// detached.
    pub fn delete(&self, store: &mut dyn ContentStore, name: &str) -> WorkflowResult<usize> {
        self.transaction(store, |store| {
            let workflow_node = find_workflow(store, name)?
                .ok_or_else(|| WorkflowError::UnknownWorkflow(name.to_string()))?;

            let mut detached = 0;
            for step_node in step_nodes(store, workflow_node)? {
                for item in store.children(step_node)? {
                    store.remove_child(step_node, item)?;
                    detached += 1;
                }
                store.delete_node(step_node)?;
            }
            store.delete_node(workflow_node)?;

            if detached > 0 {
                warn!(
                    "Deleted workflow '{}' - detached {} item(s) from its steps",
                    name, detached
                );
            } else {
                info!("Deleted workflow '{}'", name);
            }
            Ok(detached)
        })
    }

    /// Copies the workflow's ruleset for one capability to every step.
    /// Returns the number of steps updated.
    pub fn inherit_access(
        &self,
        store: &mut dyn ContentStore,
        name: &str,
        capability: Capability,
    ) -> WorkflowResult<usize> {
        self.transaction(store, |store| {
            let mut definition = load_by_name(store, name)?;
            let ruleset = definition.access.get(capability).to_string();
            for step in &mut definition.steps {
                step.access.set(capability, ruleset.clone());
            }
            self.save_unlocked(store, &definition)?;
            info!(
                "Copied {} rights of workflow '{}' to {} steps",
                capability,
                name,
                definition.steps.len()
            );
            Ok(definition.steps.len())
        })
    }
}

//! Content Store Module
//!
//! The engine persists everything (workflow definitions, steps, content
//! items) in a generic tree of nodes. Containment of an item in a step is
//! nothing more than a parent/child edge in this tree.
//!
//! - [`ContentStore`]: the adapter contract the engine consumes
//! - [`memory`]: in-memory tree with per-request sessions and JSON persistence

pub mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::{MemoryStore, StoreSession};

/// Identifier of a node in the content tree.
pub type NodeId = u64;

/// A file attached to a node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FileAttachment {
    /// File name including extension
    pub name: String,
    /// Logical file type (e.g. "document", "image")
    pub file_type: String,
    #[serde(default)]
    pub mime_type: String,
}

impl FileAttachment {
    pub fn new(name: impl Into<String>, file_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_type: file_type.into(),
            mime_type: String::new(),
        }
    }
}

/// A node of the content tree.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub node_type: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileAttachment>,

    /// Ordered child ids
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeId>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<NodeId>,
}

impl Node {
    pub fn new(id: NodeId, name: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            node_type: node_type.into(),
            attributes: BTreeMap::new(),
            files: Vec::new(),
            children: Vec::new(),
            parents: Vec::new(),
        }
    }

    /// Returns an attribute value, or an empty string when unset.
    pub fn get(&self, key: &str) -> &str {
        self.attributes.get(key).map(String::as_str).unwrap_or("")
    }
}

/// Errors raised by a content store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node {0} does not exist")]
    NodeNotFound(NodeId),

    #[error("node {child} is not a child of node {parent}")]
    NotAChild { parent: NodeId, child: NodeId },

    #[error("node {child} is already a child of node {parent}")]
    AlreadyChild { parent: NodeId, child: NodeId },

    #[error("failed to persist store to '{path}': {message}")]
    Persist { path: String, message: String },

    #[error("failed to load store from '{path}': {message}")]
    Load { path: String, message: String },

    /// Staged changes no longer apply to the committed tree.
    #[error("conflicting change: {0}")]
    Conflict(String),
}

/// Tree-structured persistence consumed by the engine.
///
/// Implementations are request-scoped sessions: mutations are staged until
/// [`commit`](ContentStore::commit) and discarded by
/// [`rollback`](ContentStore::rollback). A session without staged changes
/// reads the latest committed state. A session with staged changes reads its
/// own writes on top of the committed state it last saw; call
/// [`refresh`](ContentStore::refresh) to rebase them onto the latest one.
///
/// Committing merges the staged mutations into whatever is committed at that
/// moment. Mutations of other sessions committed in between are preserved.
pub trait ContentStore {
    /// Returns the named top-level node, creating it if needed.
    fn root(&mut self, name: &str) -> Result<NodeId, StoreError>;

    /// Returns the named top-level node if it exists.
    fn find_root(&self, name: &str) -> Result<Option<NodeId>, StoreError>;

    fn create_node(&mut self, name: &str, node_type: &str) -> Result<NodeId, StoreError>;

    /// Deletes a node, detaching it from all parents and children.
    fn delete_node(&mut self, id: NodeId) -> Result<(), StoreError>;

    /// Returns a snapshot of the node.
    fn node(&self, id: NodeId) -> Result<Node, StoreError>;

    fn parents(&self, id: NodeId) -> Result<Vec<NodeId>, StoreError>;

    fn children(&self, id: NodeId) -> Result<Vec<NodeId>, StoreError>;

    fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), StoreError>;

    fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), StoreError>;

    fn get(&self, id: NodeId, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&mut self, id: NodeId, key: &str, value: &str) -> Result<(), StoreError>;

    fn unset(&mut self, id: NodeId, key: &str) -> Result<(), StoreError>;

    fn rename(&mut self, id: NodeId, name: &str) -> Result<(), StoreError>;

    fn add_file(&mut self, id: NodeId, file: FileAttachment) -> Result<(), StoreError>;

    /// True when this session holds uncommitted mutations.
    fn has_pending_changes(&self) -> bool;

    /// Rebases staged mutations onto the latest committed state.
    fn refresh(&mut self) -> Result<(), StoreError>;

    /// Publishes staged mutations. On [`StoreError::Conflict`] nothing is
    /// published and the mutations stay staged.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Discards uncommitted mutations.
    fn rollback(&mut self);

    /// Returns the parents of `item` whose node type is `parent_type`.
    fn containing_parents(
        &self,
        item: NodeId,
        parent_type: &str,
    ) -> Result<Vec<NodeId>, StoreError> {
        let mut result = Vec::new();
        for parent in self.parents(item)? {
            if self.node(parent)?.node_type == parent_type {
                result.push(parent);
            }
        }
        Ok(result)
    }

    /// Returns the first child of `parent` with the given name.
    fn child_named(&self, parent: NodeId, name: &str) -> Result<Option<NodeId>, StoreError> {
        for child in self.children(parent)? {
            if self.node(child)?.name == name {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }
}

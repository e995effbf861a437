//! In-Memory Content Store
//!
//! A shared committed tree plus request-scoped [`StoreSession`]s. A session
//! records every mutation in a change log and applies it to a private
//! working copy, so it reads its own writes. On commit the log is replayed
//! onto the committed tree as it is at that moment, under the store mutex.
//! Changes other sessions committed in the meantime are kept; a change that
//! no longer applies (its node is gone, the child already moved) fails the
//! whole commit with [`StoreError::Conflict`].
//!
//! Node ids are allocated from the committed tree, so ids handed out by
//! different sessions never collide. When the store was opened from a file,
//! every commit also writes the tree back as JSON.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{ContentStore, FileAttachment, Node, NodeId, StoreError};

/// Serializable tree state.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct Tree {
    next_id: NodeId,
    #[serde(default)]
    roots: BTreeMap<String, NodeId>,
    #[serde(default)]
    nodes: BTreeMap<NodeId, Node>,
}

/// One staged mutation.
#[derive(Debug, Clone)]
enum Change {
    Root { id: NodeId, name: String },
    Create { id: NodeId, name: String, node_type: String },
    Delete(NodeId),
    AppendChild { parent: NodeId, child: NodeId },
    RemoveChild { parent: NodeId, child: NodeId },
    Set { id: NodeId, key: String, value: String },
    Unset { id: NodeId, key: String },
    Rename { id: NodeId, name: String },
    AddFile { id: NodeId, file: FileAttachment },
}

impl Tree {
    fn node(&self, id: NodeId) -> Result<&Node, StoreError> {
        self.nodes.get(&id).ok_or(StoreError::NodeNotFound(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, StoreError> {
        self.nodes.get_mut(&id).ok_or(StoreError::NodeNotFound(id))
    }

    fn allocate(&mut self) -> NodeId {
        self.next_id += 1;
        self.next_id
    }

    fn insert(&mut self, id: NodeId, name: &str, node_type: &str) {
        self.nodes.insert(id, Node::new(id, name, node_type));
        self.next_id = self.next_id.max(id);
    }

    /// Applies a change. A failing change leaves the tree untouched.
    fn apply(&mut self, change: &Change) -> Result<(), StoreError> {
        match change {
            Change::Root { id, name } => {
                if let Some(existing) = self.roots.get(name) {
                    return Err(StoreError::Conflict(format!(
                        "root '{}' already exists as node {}",
                        name, existing
                    )));
                }
                self.insert(*id, name, name);
                self.roots.insert(name.clone(), *id);
            }
            Change::Create {
                id,
                name,
                node_type,
            } => self.insert(*id, name, node_type),
            Change::Delete(id) => {
                let node = self.nodes.remove(id).ok_or(StoreError::NodeNotFound(*id))?;
                for parent in &node.parents {
                    if let Some(p) = self.nodes.get_mut(parent) {
                        p.children.retain(|c| c != id);
                    }
                }
                for child in &node.children {
                    if let Some(c) = self.nodes.get_mut(child) {
                        c.parents.retain(|p| p != id);
                    }
                }
                self.roots.retain(|_, root| root != id);
            }
            Change::AppendChild { parent, child } => {
                let (parent, child) = (*parent, *child);
                self.node(child)?;
                let p = self.node_mut(parent)?;
                if p.children.contains(&child) {
                    return Err(StoreError::AlreadyChild { parent, child });
                }
                p.children.push(child);
                self.node_mut(child)?.parents.push(parent);
            }
            Change::RemoveChild { parent, child } => {
                let (parent, child) = (*parent, *child);
                self.node(child)?;
                let p = self.node_mut(parent)?;
                if !p.children.contains(&child) {
                    return Err(StoreError::NotAChild { parent, child });
                }
                p.children.retain(|c| *c != child);
                self.node_mut(child)?.parents.retain(|p| *p != parent);
            }
            Change::Set { id, key, value } => {
                self.node_mut(*id)?
                    .attributes
                    .insert(key.clone(), value.clone());
            }
            Change::Unset { id, key } => {
                self.node_mut(*id)?.attributes.remove(key);
            }
            Change::Rename { id, name } => {
                self.node_mut(*id)?.name = name.clone();
            }
            Change::AddFile { id, file } => {
                self.node_mut(*id)?.files.push(file.clone());
            }
        }
        Ok(())
    }

    /// Replays a change log, turning any failure into a conflict.
    fn replay(&mut self, changes: &[Change]) -> Result<(), StoreError> {
        for change in changes {
            self.apply(change).map_err(|e| match e {
                StoreError::Conflict(_) => e,
                other => StoreError::Conflict(other.to_string()),
            })?;
        }
        Ok(())
    }
}

/// Shared handle to an in-memory content tree.
///
/// Cloning the store clones the handle, not the data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    committed: Arc<Mutex<Tree>>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// Creates an empty, non-persistent store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a file-backed store. A missing file yields an empty store that
    /// is created on the first commit.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let tree = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| StoreError::Load {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            let tree: Tree = serde_json::from_str(&content).map_err(|e| StoreError::Load {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            info!("Loaded {} nodes from {}", tree.nodes.len(), path.display());
            tree
        } else {
            info!("Store file {} not found - starting empty", path.display());
            Tree::default()
        };

        Ok(Self {
            committed: Arc::new(Mutex::new(tree)),
            path: Some(path),
        })
    }

    /// Returns the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Opens a new request-scoped session.
    pub fn session(&self) -> StoreSession {
        StoreSession {
            store: self.clone(),
            working: None,
            changes: Vec::new(),
        }
    }

    /// Number of committed nodes.
    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        // A panicking writer never leaves a half-applied tree behind: the
        // committed tree is only ever replaced wholesale.
        self.committed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, tree: &Tree) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let to_error = |message: String| StoreError::Persist {
            path: path.display().to_string(),
            message,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| to_error(e.to_string()))?;
            }
        }

        let json = serde_json::to_string_pretty(tree).map_err(|e| to_error(e.to_string()))?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, json).map_err(|e| to_error(e.to_string()))?;
        fs::rename(&tmp_path, path).map_err(|e| to_error(e.to_string()))?;

        debug!("Persisted {} nodes to {}", tree.nodes.len(), path.display());
        Ok(())
    }
}

/// A request-scoped view of a [`MemoryStore`].
///
/// Dropping a session with uncommitted changes discards them.
#[derive(Debug)]
pub struct StoreSession {
    store: MemoryStore,
    /// Committed tree at first write (or last refresh) plus `changes`
    working: Option<Tree>,
    changes: Vec<Change>,
}

impl StoreSession {
    fn read<T>(&self, f: impl FnOnce(&Tree) -> Result<T, StoreError>) -> Result<T, StoreError> {
        match &self.working {
            Some(tree) => f(tree),
            None => f(&self.store.lock()),
        }
    }

    fn record(&mut self, change: Change) -> Result<(), StoreError> {
        let tree = self
            .working
            .get_or_insert_with(|| self.store.lock().clone());
        if let Err(e) = tree.apply(&change) {
            if self.changes.is_empty() {
                self.working = None;
            }
            return Err(e);
        }
        self.changes.push(change);
        Ok(())
    }

    fn allocate_id(&self) -> NodeId {
        self.store.lock().allocate()
    }
}

impl ContentStore for StoreSession {
    fn root(&mut self, name: &str) -> Result<NodeId, StoreError> {
        if let Some(id) = self.find_root(name)? {
            return Ok(id);
        }
        let id = self.allocate_id();
        self.record(Change::Root {
            id,
            name: name.to_string(),
        })?;
        debug!("Created root node '{}' ({})", name, id);
        Ok(id)
    }

    fn find_root(&self, name: &str) -> Result<Option<NodeId>, StoreError> {
        self.read(|tree| Ok(tree.roots.get(name).copied()))
    }

    fn create_node(&mut self, name: &str, node_type: &str) -> Result<NodeId, StoreError> {
        let id = self.allocate_id();
        self.record(Change::Create {
            id,
            name: name.to_string(),
            node_type: node_type.to_string(),
        })?;
        Ok(id)
    }

    fn delete_node(&mut self, id: NodeId) -> Result<(), StoreError> {
        self.record(Change::Delete(id))
    }

    fn node(&self, id: NodeId) -> Result<Node, StoreError> {
        self.read(|tree| tree.node(id).cloned())
    }

    fn parents(&self, id: NodeId) -> Result<Vec<NodeId>, StoreError> {
        self.read(|tree| Ok(tree.node(id)?.parents.clone()))
    }

    fn children(&self, id: NodeId) -> Result<Vec<NodeId>, StoreError> {
        self.read(|tree| Ok(tree.node(id)?.children.clone()))
    }

    fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), StoreError> {
        self.record(Change::AppendChild { parent, child })
    }

    fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), StoreError> {
        self.record(Change::RemoveChild { parent, child })
    }

    fn get(&self, id: NodeId, key: &str) -> Result<Option<String>, StoreError> {
        self.read(|tree| Ok(tree.node(id)?.attributes.get(key).cloned()))
    }

    fn set(&mut self, id: NodeId, key: &str, value: &str) -> Result<(), StoreError> {
        self.record(Change::Set {
            id,
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn unset(&mut self, id: NodeId, key: &str) -> Result<(), StoreError> {
        self.record(Change::Unset {
            id,
            key: key.to_string(),
        })
    }

    fn rename(&mut self, id: NodeId, name: &str) -> Result<(), StoreError> {
        self.record(Change::Rename {
            id,
            name: name.to_string(),
        })
    }

    fn add_file(&mut self, id: NodeId, file: FileAttachment) -> Result<(), StoreError> {
        self.record(Change::AddFile { id, file })
    }

    fn has_pending_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    fn refresh(&mut self) -> Result<(), StoreError> {
        if self.changes.is_empty() {
            self.working = None;
            return Ok(());
        }

        let mut tree = self.store.lock().clone();
        tree.replay(&self.changes)?;
        self.working = Some(tree);
        debug!("Rebased {} pending change(s)", self.changes.len());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if self.changes.is_empty() {
            self.working = None;
            return Ok(());
        }

        let mut committed = self.store.lock();
        let mut tree = committed.clone();
        if let Err(e) = tree.replay(&self.changes) {
            warn!("Commit refused: {}", e);
            return Err(e);
        }

        // Persist before publishing so a failed write leaves the committed
        // tree untouched.
        if let Err(e) = self.store.persist(&tree) {
            warn!("Commit failed: {}", e);
            return Err(e);
        }
        *committed = tree;
        drop(committed);

        debug!("Committed {} change(s)", self.changes.len());
        self.changes.clear();
        self.working = None;
        Ok(())
    }

    fn rollback(&mut self) {
        self.working = None;
        if !self.changes.is_empty() {
            debug!("Discarded {} uncommitted change(s)", self.changes.len());
            self.changes.clear();
        }
    }
}

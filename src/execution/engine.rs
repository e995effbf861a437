//! Transition Engine
//!
//! The state-machine core. Given an item contained by some step and a
//! boolean outcome, the engine:
//! 1. Resolves the step that currently holds the item
//! 2. Loads the step's workflow and resolves its behaviors
//! 3. Picks the true or false edge and resolves the target step
//! 4. Moves containment from the current to the target step and commits
//! 5. Runs the target step's action
//!
//! Every public operation holds the [`ConcurrencyGuard`] for its whole
//! duration and rebases the session's staged changes onto the latest
//! committed tree right after acquiring it. Behaviors that drive the item further go through
//! [`StepContext::forward`](super::behavior::StepContext::forward), which
//! reuses the held lock.
//!
//! # Failure Model
//!
//! A failure before the containment commit leaves the item where it was. A
//! behavior failure after the commit leaves the item in the new step; the
//! error is recorded on the item (`workflow.error`, `workflow.errorstep`,
//! `workflow.errortime`) and surfaced as
//! [`WorkflowError::BehaviorExecution`]. The next successful transition
//! clears the record.

use std::sync::{Arc, MutexGuard};

use chrono::Local;
use log::{debug, error, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{WorkflowError, WorkflowResult};
use crate::store::{ContentStore, NodeId, StoreError};
use crate::workflow::model::{Step, STEP_NODE_TYPE, WORKFLOW_NODE_TYPE};
use crate::workflow::repository::{self, WorkflowRepository};

use super::behavior::{BehaviorError, StepContext};
use super::guard::ConcurrencyGuard;
use super::page::{Page, Request};
use super::registry::{BoundWorkflow, StepRegistry};

/// Log target of the transition audit trail.
pub const AUDIT_TARGET: &str = "docflow::audit";

/// Item attributes recording the last behavior failure.
pub const ERROR_ATTR: &str = "workflow.error";
pub const ERROR_STEP_ATTR: &str = "workflow.errorstep";
pub const ERROR_TIME_ATTR: &str = "workflow.errortime";

/// Timestamp format used for item attributes.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Engine tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Maximum number of chained automatic transitions per request
    pub max_chain_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_chain_depth: 32 }
    }
}

/// Identifies a step in a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRef {
    pub workflow: String,
    pub step: String,
    /// Store node of the step
    pub node: NodeId,
}

/// Where an item currently sits, with its workflow loaded.
struct Location {
    workflow: BoundWorkflow,
    step_node: NodeId,
}

impl Location {
    fn step(&self) -> WorkflowResult<&Step> {
        let definition = self.workflow.definition();
        definition
            .step_by_node(self.step_node)
            .ok_or_else(|| WorkflowError::UnknownStep {
                workflow: definition.name.clone(),
                step: format!("#{}", self.step_node),
            })
    }
}

fn step_ref(workflow: &BoundWorkflow, step: &Step, node: NodeId) -> StepRef {
    StepRef {
        workflow: workflow.definition().name.clone(),
        step: step.name.clone(),
        node,
    }
}

/// Advances content items through workflow graphs.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use docflow::execution::{StepRegistry, TransitionEngine};
/// use docflow::store::{ContentStore, MemoryStore};
/// use docflow::workflow::{Step, WorkflowDefinition};
///
/// let engine = TransitionEngine::new(Arc::new(StepRegistry::with_builtin_steps().unwrap()));
/// let store = MemoryStore::new();
/// let mut session = store.session();
///
/// let definition = WorkflowDefinition::new("submission")
///     .with_step(Step::new("start", "start").with_true("review"))
///     .with_step(Step::new("review", "wait").with_true("end").with_false("start"))
///     .with_step(Step::new("end", "end"));
/// engine.repository().create(&mut session, definition).unwrap();
///
/// let item = session.create_node("thesis", "document").unwrap();
/// session.commit().unwrap();
///
/// engine.enter_workflow(&mut session, "submission", item).unwrap();
/// let step = engine.forward(&mut session, item, true).unwrap();
/// assert_eq!(step.step, "review");
/// ```
pub struct TransitionEngine {
    registry: Arc<StepRegistry>,
    guard: ConcurrencyGuard,
    config: EngineConfig,
}

impl TransitionEngine {
    /// Creates an engine using the process-wide lock.
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self {
            registry,
            guard: ConcurrencyGuard::global(),
            config: EngineConfig::default(),
        }
    }

    /// Uses a different lock. Engines sharing a store must share a guard.
    pub fn with_guard(mut self, guard: ConcurrencyGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn guard(&self) -> &ConcurrencyGuard {
        &self.guard
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Administrative access to workflow definitions, sharing this engine's
    /// registry and lock.
    pub fn repository(&self) -> WorkflowRepository {
        WorkflowRepository::new(Arc::clone(&self.registry), self.guard.clone())
    }

    /// Acquires the guard and rebases the session onto the latest committed
    /// tree.
    pub(crate) fn lock_fresh(
        &self,
        store: &mut dyn ContentStore,
    ) -> WorkflowResult<MutexGuard<'_, ()>> {
        let lock = self.guard.acquire();
        store.refresh()?;
        Ok(lock)
    }

    /// Returns the step currently holding the item, if any.
    pub fn current_step(
        &self,
        store: &dyn ContentStore,
        item: NodeId,
    ) -> WorkflowResult<Option<StepRef>> {
        match self.locate(store, item)? {
            Some(location) => {
                let step = location.step()?;
                Ok(Some(step_ref(&location.workflow, step, location.step_node)))
            }
            None => Ok(None),
        }
    }

    /// Places an item in the start step of a workflow and runs the start
    /// step's action with outcome `true`.
    pub fn enter_workflow(
        &self,
        store: &mut dyn ContentStore,
        workflow: &str,
        item: NodeId,
    ) -> WorkflowResult<StepRef> {
        let _lock = self.lock_fresh(store)?;
        self.enter_locked(store, workflow, item)
    }

    /// Creates a new item and enters it into a workflow.
    ///
    /// The item gets `creator = workflow-<name>`, a `creationtime` and a
    /// random access `key`.
    pub fn create_item(
        &self,
        store: &mut dyn ContentStore,
        workflow: &str,
        name: &str,
        node_type: &str,
    ) -> WorkflowResult<(NodeId, StepRef)> {
        let _lock = self.lock_fresh(store)?;

        if repository::find_workflow(store, workflow)?.is_none() {
            return Err(WorkflowError::UnknownWorkflow(workflow.to_string()));
        }

        let item = match new_item(store, workflow, name, node_type) {
            Ok(item) => item,
            Err(e) => {
                store.rollback();
                return Err(e.into());
            }
        };
        info!("Created item {} ('{}') for workflow '{}'", item, name, workflow);

        let step = self.enter_locked(store, workflow, item)?;
        Ok((item, step))
    }

    /// Moves an item along the branch selected by `outcome`.
    ///
    /// Returns the step the item was moved into. If that step's action drove
    /// the item further, [`current_step`](Self::current_step) tells where it
    /// ended up.
    pub fn forward(
        &self,
        store: &mut dyn ContentStore,
        item: NodeId,
        outcome: bool,
    ) -> WorkflowResult<StepRef> {
        let _lock = self.lock_fresh(store)?;
        self.forward_locked(store, item, outcome, 0)
    }

    /// Forwards an item and renders the step it ends up in.
    ///
    /// The containing step is resolved again after the transition, since a
    /// self-driving step may already have moved the item on.
    pub fn forward_and_render(
        &self,
        store: &mut dyn ContentStore,
        item: NodeId,
        outcome: bool,
        request: &Request,
    ) -> WorkflowResult<Page> {
        let _lock = self.lock_fresh(store)?;
        self.forward_and_render_locked(store, item, outcome, request)
    }

    /// Renders the step currently holding the item.
    pub fn render(
        &self,
        store: &mut dyn ContentStore,
        item: NodeId,
        request: &Request,
    ) -> WorkflowResult<Page> {
        let _lock = self.lock_fresh(store)?;
        self.render_locked(store, item, request, None, 0)
    }

    fn enter_locked(
        &self,
        store: &mut dyn ContentStore,
        workflow_name: &str,
        item: NodeId,
    ) -> WorkflowResult<StepRef> {
        let holders = store.containing_parents(item, STEP_NODE_TYPE)?;
        if !holders.is_empty() {
            return Err(WorkflowError::ContainmentViolation {
                item,
                steps: holders,
            });
        }

        let workflow_node = repository::find_workflow(store, workflow_name)?
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_name.to_string()))?;
        let workflow = self.load(store, workflow_node)?;

        let start = workflow.definition().start_step()?;
        let start_node = self.node_of(&workflow, start)?;

        if let Err(e) = store
            .append_child(start_node, item)
            .and_then(|_| store.commit())
        {
            store.rollback();
            return Err(e.into());
        }

        info!(
            target: AUDIT_TARGET,
            "item={} workflow='{}' entered step='{}'",
            item,
            workflow_name,
            start.name
        );

        self.run_behavior(store, &workflow, start, item, true, 0)?;
        Ok(step_ref(&workflow, start, start_node))
    }

    /// Core transition. Callers must hold the guard.
    pub(crate) fn forward_locked(
        &self,
        store: &mut dyn ContentStore,
        item: NodeId,
        outcome: bool,
        depth: usize,
    ) -> WorkflowResult<StepRef> {
        if depth > self.config.max_chain_depth {
            error!(
                "Transition chain for item {} exceeded {} steps - aborting",
                item, self.config.max_chain_depth
            );
            return Err(WorkflowError::TransitionChainTooLong {
                item,
                limit: self.config.max_chain_depth,
            });
        }

        let location = self
            .locate(store, item)?
            .ok_or(WorkflowError::NotInWorkflow { item })?;
        let workflow = &location.workflow;
        let definition = workflow.definition();
        let current = location.step()?;

        let target_name =
            current
                .target_for(outcome)
                .ok_or_else(|| WorkflowError::NoTransitionDefined {
                    workflow: definition.name.clone(),
                    step: current.name.clone(),
                    outcome,
                })?;
        let target = definition.step(target_name)?;
        let target_node = self.node_of(workflow, target)?;

        if target_node == location.step_node {
            debug!(
                "Item {} stays in step '{}' (self transition)",
                item, current.name
            );
        } else if let Err(e) = store
            .remove_child(location.step_node, item)
            .and_then(|_| store.append_child(target_node, item))
            .and_then(|_| store.commit())
        {
            store.rollback();
            error!(
                "Failed to move item {} from '{}' to '{}': {}",
                item, current.name, target.name, e
            );
            return Err(e.into());
        }

        info!(
            target: AUDIT_TARGET,
            "item={} workflow='{}' from='{}' to='{}' outcome={}",
            item,
            definition.name,
            current.name,
            target.name,
            outcome
        );

        self.run_behavior(store, workflow, target, item, outcome, depth)?;
        Ok(step_ref(workflow, target, target_node))
    }

    pub(crate) fn forward_and_render_locked(
        &self,
        store: &mut dyn ContentStore,
        item: NodeId,
        outcome: bool,
        request: &Request,
    ) -> WorkflowResult<Page> {
        let landed = self.forward_locked(store, item, outcome, 0)?;
        self.render_locked(store, item, &request.without_actions(), Some(&landed), 0)
    }

    /// Renders the step holding the item. Callers must hold the guard.
    pub(crate) fn render_locked(
        &self,
        store: &mut dyn ContentStore,
        item: NodeId,
        request: &Request,
        landed: Option<&StepRef>,
        depth: usize,
    ) -> WorkflowResult<Page> {
        let location = match self.locate(store, item)? {
            Some(location) => location,
            None => {
                return match landed {
                    Some(last) => Ok(Page::Finished {
                        item,
                        workflow: last.workflow.clone(),
                        step: last.step.clone(),
                    }),
                    None => Err(WorkflowError::NotInWorkflow { item }),
                }
            }
        };

        let step = location.step()?;
        let behavior = location.workflow.behavior(&step.name)?;

        let result = {
            let mut ctx = StepContext::new(self, &mut *store, &location.workflow, step, item, depth);
            behavior.render(&mut ctx, request)
        };

        match result {
            Ok(page) => Ok(page),
            Err(BehaviorError::Engine(e)) => Err(e),
            Err(BehaviorError::Failed(message)) => {
                error!(
                    "Rendering step '{}' of workflow '{}' failed for item {}: {}",
                    step.name,
                    location.workflow.definition().name,
                    item,
                    message
                );
                if store.has_pending_changes() {
                    warn!(
                        "Rendering step '{}' left uncommitted changes for item {} - discarding",
                        step.name, item
                    );
                    store.rollback();
                }
                if let Err(e) = record_error(store, item, &step.name, &message) {
                    warn!("Could not record error on item {}: {}", item, e);
                    store.rollback();
                }
                Err(WorkflowError::BehaviorExecution {
                    item,
                    workflow: location.workflow.definition().name.clone(),
                    step: step.name.clone(),
                    outcome: true,
                    message,
                })
            }
        }
    }

    /// Runs a step's action and applies the error policy.
    fn run_behavior(
        &self,
        store: &mut dyn ContentStore,
        workflow: &BoundWorkflow,
        step: &Step,
        item: NodeId,
        outcome: bool,
        depth: usize,
    ) -> WorkflowResult<()> {
        let behavior = workflow.behavior(&step.name)?;

        let result = {
            let mut ctx = StepContext::new(self, &mut *store, workflow, step, item, depth);
            behavior.run_action(&mut ctx, outcome)
        };

        if store.has_pending_changes() {
            warn!(
                "Step '{}' left uncommitted changes for item {} - discarding",
                step.name, item
            );
            store.rollback();
        }

        match result {
            Ok(()) => {
                clear_error(store, item)?;
                Ok(())
            }
            Err(BehaviorError::Engine(e)) => Err(e),
            Err(BehaviorError::Failed(message)) => {
                let workflow_name = &workflow.definition().name;
                error!(
                    "Step '{}' of workflow '{}' failed for item {} (outcome {}): {}",
                    step.name, workflow_name, item, outcome, message
                );
                if let Err(e) = record_error(store, item, &step.name, &message) {
                    warn!("Could not record error on item {}: {}", item, e);
                    store.rollback();
                }
                Err(WorkflowError::BehaviorExecution {
                    item,
                    workflow: workflow_name.clone(),
                    step: step.name.clone(),
                    outcome,
                    message,
                })
            }
        }
    }

    /// Finds the step holding the item and loads its workflow.
    fn locate(&self, store: &dyn ContentStore, item: NodeId) -> WorkflowResult<Option<Location>> {
        let holders = store.containing_parents(item, STEP_NODE_TYPE)?;
        let step_node = match holders.as_slice() {
            [] => return Ok(None),
            [step] => *step,
            _ => {
                error!("Item {} is held by several steps: {:?}", item, holders);
                return Err(WorkflowError::ContainmentViolation {
                    item,
                    steps: holders,
                });
            }
        };

        let workflow_node = store
            .containing_parents(step_node, WORKFLOW_NODE_TYPE)?
            .first()
            .copied()
            .ok_or_else(|| {
                WorkflowError::UnknownWorkflow(format!("<parent of step node {}>", step_node))
            })?;

        let workflow = self.load(store, workflow_node)?;
        Ok(Some(Location {
            workflow,
            step_node,
        }))
    }

    fn load(&self, store: &dyn ContentStore, workflow_node: NodeId) -> WorkflowResult<BoundWorkflow> {
        let definition = repository::load_definition(store, workflow_node)?;
        Ok(BoundWorkflow::bind(definition, &self.registry)?)
    }

    fn node_of(&self, workflow: &BoundWorkflow, step: &Step) -> WorkflowResult<NodeId> {
        step.node.ok_or_else(|| WorkflowError::UnknownStep {
            workflow: workflow.definition().name.clone(),
            step: step.name.clone(),
        })
    }
}

fn new_item(
    store: &mut dyn ContentStore,
    workflow: &str,
    name: &str,
    node_type: &str,
) -> Result<NodeId, StoreError> {
    let item = store.create_node(name, node_type)?;
    store.set(item, "creator", &format!("workflow-{}", workflow))?;
    store.set(item, "creationtime", &Local::now().format(TIME_FORMAT).to_string())?;
    store.set(item, "key", &Uuid::new_v4().simple().to_string())?;
    store.commit()?;
    Ok(item)
}

fn record_error(
    store: &mut dyn ContentStore,
    item: NodeId,
    step: &str,
    message: &str,
) -> WorkflowResult<()> {
    store.set(item, ERROR_ATTR, message)?;
    store.set(item, ERROR_STEP_ATTR, step)?;
    store.set(item, ERROR_TIME_ATTR, &Local::now().format(TIME_FORMAT).to_string())?;
    store.commit()?;
    Ok(())
}

fn clear_error(store: &mut dyn ContentStore, item: NodeId) -> WorkflowResult<()> {
    if store.get(item, ERROR_ATTR)?.is_none() {
        return Ok(());
    }
    for key in [ERROR_ATTR, ERROR_STEP_ATTR, ERROR_TIME_ATTR] {
        store.unset(item, key)?;
    }
    store.commit()?;
    debug!("Cleared error record of item {}", item);
    Ok(())
}

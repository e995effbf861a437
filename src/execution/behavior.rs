//! Step Behavior Contract
//!
//! Every step type implements [`StepBehavior`]. The engine calls
//! [`run_action`](StepBehavior::run_action) right after an item was moved
//! into a step, and [`render`](StepBehavior::render) when a person visits
//! the step.
//!
//! Behaviors receive a [`StepContext`] giving them the item, the step
//! definition, the store session and a way back into the engine. Calling
//! [`StepContext::forward`] from inside a behavior continues the transition
//! chain under the lock that is already held.
//!
//! # Committing
//!
//! The engine does not commit on a behavior's behalf. A behavior that
//! mutates the item must call [`StepContext::commit`] before returning;
//! uncommitted changes are discarded with a warning.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::error::{WorkflowError, WorkflowResult};
use crate::store::{ContentStore, Node, NodeId, StoreError};
use crate::workflow::model::{Step, WorkflowDefinition};

use super::engine::{StepRef, TransitionEngine};
use super::page::{Action, Page, Request, StepView};
use super::registry::BoundWorkflow;

/// Failure reported by a behavior.
#[derive(Debug, Error)]
pub enum BehaviorError {
    /// The behavior itself failed.
    #[error("{0}")]
    Failed(String),

    /// A nested engine call failed; it has already been recorded and logged
    /// where it happened.
    #[error(transparent)]
    Engine(#[from] WorkflowError),
}

impl BehaviorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<StoreError> for BehaviorError {
    fn from(err: StoreError) -> Self {
        Self::Engine(err.into())
    }
}

/// Pluggable logic attached to a step type.
pub trait StepBehavior: Send + Sync {
    /// Invoked right after an item arrived in the step.
    fn run_action(&self, ctx: &mut StepContext<'_>, outcome: bool) -> Result<(), BehaviorError> {
        let _ = (ctx, outcome);
        Ok(())
    }

    /// Invoked when a person visits the step.
    fn render(&self, ctx: &mut StepContext<'_>, request: &Request) -> Result<Page, BehaviorError> {
        default_render(self, ctx, request)
    }

    /// Caption of the true branch. Empty means no button is offered for it.
    fn true_label(&self, step: &Step, language: &str) -> String {
        step.true_edge.label_for(language).to_string()
    }

    fn false_label(&self, step: &Step, language: &str) -> String {
        step.false_edge.label_for(language).to_string()
    }
}

/// Handles `gotrue`/`gofalse` submissions, otherwise shows the step view.
pub fn default_render<B: StepBehavior + ?Sized>(
    behavior: &B,
    ctx: &mut StepContext<'_>,
    request: &Request,
) -> Result<Page, BehaviorError> {
    for (param, outcome) in [("gotrue", true), ("gofalse", false)] {
        if request.has_param(param) {
            return Ok(ctx.forward_and_render(outcome, request)?);
        }
    }
    Ok(Page::Step(ctx.view(behavior, &request.language)?))
}

/// Everything a behavior may touch during one call.
pub struct StepContext<'a> {
    engine: &'a TransitionEngine,
    store: &'a mut dyn ContentStore,
    workflow: &'a BoundWorkflow,
    step: &'a Step,
    item: NodeId,
    depth: usize,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        engine: &'a TransitionEngine,
        store: &'a mut dyn ContentStore,
        workflow: &'a BoundWorkflow,
        step: &'a Step,
        item: NodeId,
        depth: usize,
    ) -> Self {
        Self {
            engine,
            store,
            workflow,
            step,
            item,
            depth,
        }
    }

    pub fn item(&self) -> NodeId {
        self.item
    }

    pub fn step(&self) -> &Step {
        self.step
    }

    pub fn workflow(&self) -> &WorkflowDefinition {
        self.workflow.definition()
    }

    /// The store session of the current request.
    pub fn store(&mut self) -> &mut dyn ContentStore {
        &mut *self.store
    }

    /// Snapshot of the item node.
    pub fn item_node(&self) -> Result<Node, BehaviorError> {
        Ok(self.store.node(self.item)?)
    }

    /// Reads an item attribute; empty when unset.
    pub fn get(&self, key: &str) -> Result<String, BehaviorError> {
        Ok(self.store.get(self.item, key)?.unwrap_or_default())
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), BehaviorError> {
        Ok(self.store.set(self.item, key, value)?)
    }

    pub fn commit(&mut self) -> Result<(), BehaviorError> {
        Ok(self.store.commit()?)
    }

    /// Moves the item on from this step. Runs inside the lock the engine
    /// already holds.
    pub fn forward(&mut self, outcome: bool) -> WorkflowResult<StepRef> {
        self.engine
            .forward_locked(&mut *self.store, self.item, outcome, self.depth + 1)
    }

    /// Moves the item on and renders whatever step it ends up in.
    pub fn forward_and_render(&mut self, outcome: bool, request: &Request) -> WorkflowResult<Page> {
        let landed = self.forward(outcome)?;
        self.engine.render_locked(
            &mut *self.store,
            self.item,
            &request.without_actions(),
            Some(&landed),
            self.depth + 1,
        )
    }

    /// Removes the item from workflow containment. Not committed.
    pub fn leave_workflow(&mut self) -> Result<(), BehaviorError> {
        if let Some(node) = self.step.node {
            self.store.remove_child(node, self.item)?;
        }
        Ok(())
    }

    /// Builds the default view of the item in this step.
    pub fn view<B: StepBehavior + ?Sized>(
        &self,
        behavior: &B,
        language: &str,
    ) -> Result<StepView, BehaviorError> {
        let item = self.item_node()?;

        let mut actions = Vec::new();
        for outcome in [true, false] {
            if self.step.target_for(outcome).is_none() {
                continue;
            }
            let label = if outcome {
                behavior.true_label(self.step, language)
            } else {
                behavior.false_label(self.step, language)
            };
            if !label.is_empty() {
                actions.push(Action::new(outcome, label));
            }
        }

        Ok(StepView {
            workflow: self.workflow().name.clone(),
            step: self.step.name.clone(),
            step_type: self.step.step_type.clone(),
            item: self.item,
            item_name: item.name,
            actions,
            fields: BTreeMap::new(),
        })
    }
}

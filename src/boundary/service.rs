//! Workflow service exposed to the web layer.

use std::sync::Arc;

use log::{error, warn};

use crate::access::{AccessGate, Actor, Capability};
use crate::error::{WorkflowError, WorkflowResult};
use crate::execution::engine::TransitionEngine;
use crate::execution::page::{Page, Request};
use crate::store::{ContentStore, NodeId};
use crate::workflow::repository::{self, ItemSummary};

/// Authorizes interactive requests and turns engine results into pages.
///
/// Every failure of a single request becomes a page; nothing here panics
/// or propagates an item's error further.
pub struct WorkflowService {
    engine: Arc<TransitionEngine>,
    gate: Arc<dyn AccessGate>,
}

impl WorkflowService {
    pub fn new(engine: Arc<TransitionEngine>, gate: Arc<dyn AccessGate>) -> Self {
        Self { engine, gate }
    }

    pub fn engine(&self) -> &TransitionEngine {
        &self.engine
    }

    /// Renders a step for an item.
    ///
    /// The actor needs write access on the step or must present the item's
    /// access key. `forcetrue`/`forcefalse` forward without going through
    /// the step's own render. If the item sits in another step, a redirect
    /// to that step is returned.
    pub fn render_step(
        &self,
        store: &mut dyn ContentStore,
        actor: &Actor,
        step_node: NodeId,
        item: NodeId,
        request: &Request,
    ) -> Page {
        self.try_render_step(store, actor, step_node, item, request)
            .unwrap_or_else(|e| self.error_page(e))
    }

    fn try_render_step(
        &self,
        store: &mut dyn ContentStore,
        actor: &Actor,
        step_node: NodeId,
        item: NodeId,
        request: &Request,
    ) -> WorkflowResult<Page> {
        // Checks and the transition observe the same state
        let _lock = self.engine.lock_fresh(store)?;

        if !self.may_operate(store, actor, step_node, item, request)? {
            warn!(
                "Actor '{}' may not operate step node {} for item {}",
                actor.name, step_node, item
            );
            return Err(WorkflowError::PermissionDenied);
        }

        let current = self
            .engine
            .current_step(store, item)?
            .ok_or(WorkflowError::NotInWorkflow { item })?;
        if current.node != step_node {
            return Ok(Page::Redirect {
                step: current.node,
                item,
            });
        }

        for (param, outcome) in [("forcetrue", true), ("forcefalse", false)] {
            if request.has_param(param) {
                return self
                    .engine
                    .forward_and_render_locked(store, item, outcome, request);
            }
        }

        self.engine.render_locked(store, item, request, None, 0)
    }

    /// Forwards an item from whatever step holds it and renders the result.
    pub fn forward(
        &self,
        store: &mut dyn ContentStore,
        actor: &Actor,
        item: NodeId,
        outcome: bool,
        request: &Request,
    ) -> Page {
        self.try_forward(store, actor, item, outcome, request)
            .unwrap_or_else(|e| self.error_page(e))
    }

    fn try_forward(
        &self,
        store: &mut dyn ContentStore,
        actor: &Actor,
        item: NodeId,
        outcome: bool,
        request: &Request,
    ) -> WorkflowResult<Page> {
        let _lock = self.engine.lock_fresh(store)?;

        let current = self
            .engine
            .current_step(store, item)?
            .ok_or(WorkflowError::NotInWorkflow { item })?;
        if !self.may_operate(store, actor, current.node, item, request)? {
            return Err(WorkflowError::PermissionDenied);
        }
        self.engine
            .forward_and_render_locked(store, item, outcome, request)
    }

    /// Creates an item in a workflow the actor may write to.
    pub fn create_item(
        &self,
        store: &mut dyn ContentStore,
        actor: &Actor,
        workflow: &str,
        name: &str,
        node_type: &str,
    ) -> WorkflowResult<NodeId> {
        let workflow_node = repository::find_workflow(store, workflow)?
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow.to_string()))?;
        if !self
            .gate
            .has_access(actor, &store.node(workflow_node)?, Capability::Write)
        {
            return Err(WorkflowError::PermissionDenied);
        }
        let (item, _) = self.engine.create_item(store, workflow, name, node_type)?;
        Ok(item)
    }

    /// Names of the workflows the actor may write to.
    pub fn list_workflows(&self, store: &dyn ContentStore, actor: &Actor) -> WorkflowResult<Vec<String>> {
        let mut names = Vec::new();
        for id in self.writable_workflows(store, actor)? {
            names.push(store.node(id)?.name);
        }
        Ok(names)
    }

    /// Searches all items of workflows the actor may write to.
    pub fn search(
        &self,
        store: &dyn ContentStore,
        actor: &Actor,
        query: &str,
    ) -> WorkflowResult<Vec<ItemSummary>> {
        let workflows = self.writable_workflows(store, actor)?;
        repository::search_items(store, &workflows, query)
    }

    /// Items in a step the actor may read, sorted by name.
    pub fn list_step(
        &self,
        store: &dyn ContentStore,
        actor: &Actor,
        step_node: NodeId,
    ) -> WorkflowResult<Vec<ItemSummary>> {
        if !self
            .gate
            .has_access(actor, &store.node(step_node)?, Capability::Read)
        {
            return Err(WorkflowError::PermissionDenied);
        }
        repository::step_items(store, step_node)
    }

    fn writable_workflows(&self, store: &dyn ContentStore, actor: &Actor) -> WorkflowResult<Vec<NodeId>> {
        let mut result = Vec::new();
        for id in repository::workflow_nodes(store)? {
            if self.gate.has_access(actor, &store.node(id)?, Capability::Write) {
                result.push(id);
            }
        }
        Ok(result)
    }

    fn may_operate(
        &self,
        store: &dyn ContentStore,
        actor: &Actor,
        step_node: NodeId,
        item: NodeId,
        request: &Request,
    ) -> WorkflowResult<bool> {
        if self
            .gate
            .has_access(actor, &store.node(step_node)?, Capability::Write)
        {
            return Ok(true);
        }

        let presented = request.key.as_deref().unwrap_or("");
        if presented.is_empty() {
            return Ok(false);
        }
        Ok(store.get(item, "key")?.as_deref() == Some(presented))
    }

    fn error_page(&self, err: WorkflowError) -> Page {
        match err {
            WorkflowError::NotInWorkflow { item } => Page::NotInWorkflow { item },
            WorkflowError::PermissionDenied => Page::PermissionDenied,
            err => {
                if err.is_configuration_error() {
                    error!("Workflow configuration error: {}", err);
                } else {
                    warn!("Workflow request failed: {}", err);
                }
                Page::Error {
                    message: err.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::RulesetGate;
    use crate::execution::guard::ConcurrencyGuard;
    use crate::execution::registry::StepRegistry;
    use crate::store::MemoryStore;
    use crate::workflow::{Step, WorkflowDefinition};

    struct Fixture {
        service: WorkflowService,
        store: MemoryStore,
        item: NodeId,
        key: String,
    }

    impl Fixture {
        fn step_node(&self, name: &str) -> NodeId {
            repository::load_by_name(&self.store.session(), "submission")
                .unwrap()
                .get_step(name)
                .unwrap()
                .node
                .unwrap()
        }
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(StepRegistry::with_builtin_steps().unwrap());
        let engine = Arc::new(TransitionEngine::new(registry).with_guard(ConcurrencyGuard::new()));
        let service = WorkflowService::new(Arc::clone(&engine), Arc::new(RulesetGate));

        let mut start = Step::new("start", "start").with_true("review").with_true_label("Submit");
        start.access.set(Capability::Write, "{group authors}");
        let mut review = Step::new("review", "wait")
            .with_true("end")
            .with_true_label("Accept")
            .with_false("start")
            .with_false_label("Reject");
        review.access.set(Capability::Write, "{group editors}");
        let mut definition = WorkflowDefinition::new("submission")
            .with_step(start)
            .with_step(review)
            .with_step(Step::new("end", "end").with_setting("endtext", "Published"));
        definition.access.set(Capability::Write, "{group editors}");

        let store = MemoryStore::new();
        let mut session = store.session();
        engine.repository().create(&mut session, definition).unwrap();
        let (item, _) = engine
            .create_item(&mut session, "submission", "thesis", "document")
            .unwrap();
        let key = session.get(item, "key").unwrap().unwrap();

        Fixture {
            service,
            store,
            item,
            key,
        }
    }

    #[test]
    fn test_render_requires_write_access() {
        let f = fixture();
        let page = f.service.render_step(
            &mut f.store.session(),
            &Actor::new("mallory"),
            f.step_node("start"),
            f.item,
            &Request::new(),
        );
        assert_eq!(page, Page::PermissionDenied);
    }

    #[test]
    fn test_access_key_grants_operation() {
        let f = fixture();
        let page = f.service.render_step(
            &mut f.store.session(),
            &Actor::new("anonymous"),
            f.step_node("start"),
            f.item,
            &Request::new().with_key(f.key.clone()),
        );
        assert!(matches!(page, Page::Step(view) if view.step == "start"));

        let wrong = f.service.render_step(
            &mut f.store.session(),
            &Actor::new("anonymous"),
            f.step_node("start"),
            f.item,
            &Request::new().with_key("guess"),
        );
        assert_eq!(wrong, Page::PermissionDenied);
    }

    #[test]
    fn test_redirect_to_holding_step() {
        let f = fixture();
        let editor = Actor::new("ed").with_group("editors");
        let page = f.service.render_step(
            &mut f.store.session(),
            &editor,
            f.step_node("review"),
            f.item,
            &Request::new(),
        );
        assert_eq!(
            page,
            Page::Redirect {
                step: f.step_node("start"),
                item: f.item
            }
        );
    }

    #[test]
    fn test_gotrue_submission_forwards_and_renders() {
        let f = fixture();
        let author = Actor::new("ann").with_group("authors");
        let page = f.service.render_step(
            &mut f.store.session(),
            &author,
            f.step_node("start"),
            f.item,
            &Request::new().with_param("gotrue", "Submit"),
        );

        match page {
            Page::Step(view) => {
                assert_eq!(view.step, "review");
                let labels: Vec<&str> = view.actions.iter().map(|a| a.label.as_str()).collect();
                assert_eq!(labels, vec!["Accept", "Reject"]);
            }
            other => panic!("expected review step, got {:?}", other),
        }
    }

    #[test]
    fn test_forcefalse_forwards_without_render() {
        let f = fixture();
        let editor = Actor::new("ed").with_group("editors");
        let mut session = f.store.session();
        f.service
            .forward(&mut session, &Actor::new("ann").with_group("authors"), f.item, true, &Request::new());

        let page = f.service.render_step(
            &mut session,
            &editor,
            f.step_node("review"),
            f.item,
            &Request::new().with_param("forcefalse", "1"),
        );
        assert!(matches!(page, Page::Step(view) if view.step == "start"));
    }

    #[test]
    fn test_forward_to_end_shows_text() {
        let f = fixture();
        let mut session = f.store.session();
        let author = Actor::new("ann").with_group("authors");
        let editor = Actor::new("ed").with_group("editors");

        f.service.forward(&mut session, &author, f.item, true, &Request::new());
        let page = f.service.forward(&mut session, &editor, f.item, true, &Request::new());
        assert_eq!(
            page,
            Page::Text {
                item: f.item,
                text: "Published".to_string()
            }
        );
    }

    #[test]
    fn test_errors_become_pages() {
        let f = fixture();
        let mut session = f.store.session();
        let author = Actor::new("ann").with_group("authors");

        // start has no false branch
        let page = f.service.forward(&mut session, &author, f.item, false, &Request::new());
        assert!(matches!(page, Page::Error { message } if message.contains("no false transition")));

        let stray = session.create_node("stray", "document").unwrap();
        session.commit().unwrap();
        let page = f.service.forward(&mut session, &author, stray, true, &Request::new());
        assert_eq!(page, Page::NotInWorkflow { item: stray });
    }

    #[test]
    fn test_listing_respects_access() {
        let f = fixture();
        let session = f.store.session();
        let editor = Actor::new("ed").with_group("editors");
        let outsider = Actor::new("bob");

        assert_eq!(f.service.list_workflows(&session, &editor).unwrap(), vec!["submission"]);
        assert!(f.service.list_workflows(&session, &outsider).unwrap().is_empty());

        let found = f.service.search(&session, &editor, "thesis").unwrap();
        assert_eq!(found.len(), 1);
        assert!(f.service.search(&session, &outsider, "*").unwrap().is_empty());

        let listed = f.service.list_step(&session, &outsider, f.step_node("start")).unwrap();
        assert_eq!(listed[0].id, f.item);
    }

    #[test]
    fn test_create_item_requires_workflow_write() {
        let f = fixture();
        let mut session = f.store.session();
        let result = f.service.create_item(
            &mut session,
            &Actor::new("bob"),
            "submission",
            "paper",
            "document",
        );
        assert!(matches!(result, Err(WorkflowError::PermissionDenied)));

        let editor = Actor::new("ed").with_group("editors");
        let item = f
            .service
            .create_item(&mut session, &editor, "submission", "paper", "document")
            .unwrap();
        assert_eq!(
            f.service.engine().current_step(&session, item).unwrap().unwrap().step,
            "start"
        );
    }

    #[test]
    fn test_render_checks_state_after_waiting_for_lock() {
        let f = fixture();
        let start = f.step_node("start");
        let review = f.step_node("review");
        let author = Actor::new("ann").with_group("authors");

        let held = f.service.engine().guard().acquire();
        let page = std::thread::scope(|scope| {
            let waiting = scope.spawn(|| {
                f.service.render_step(
                    &mut f.store.session(),
                    &author,
                    start,
                    f.item,
                    &Request::new().with_param("forcetrue", "1"),
                )
            });

            // Another request moves the item while the render waits
            std::thread::sleep(std::time::Duration::from_millis(30));
            let mut session = f.store.session();
            f.service
                .engine()
                .forward_locked(&mut session, f.item, true, 0)
                .unwrap();
            drop(held);

            waiting.join().unwrap()
        });

        assert_eq!(page, Page::Redirect { step: review, item: f.item });
        let step = f.service.engine().current_step(&f.store.session(), f.item).unwrap().unwrap();
        assert_eq!(step.step, "review");
    }
}

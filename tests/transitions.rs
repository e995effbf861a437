//! End-to-end transition scenarios against an in-memory store.

use std::sync::Arc;

use docflow::error::WorkflowError;
use docflow::execution::{BehaviorError, ConcurrencyGuard, Page, Request, StepBehavior, StepContext};
use docflow::execution::{StepRegistry, TransitionEngine};
use docflow::store::{ContentStore, FileAttachment, MemoryStore, NodeId};
use docflow::workflow::model::STEP_NODE_TYPE;
use docflow::workflow::repository;
use docflow::workflow::{Step, WorkflowDefinition};

fn engine_with(registry: StepRegistry) -> TransitionEngine {
    TransitionEngine::new(Arc::new(registry)).with_guard(ConcurrencyGuard::new())
}

fn builtin_engine() -> TransitionEngine {
    engine_with(StepRegistry::with_builtin_steps().unwrap())
}

fn install(engine: &TransitionEngine, store: &MemoryStore, definition: WorkflowDefinition) {
    engine
        .repository()
        .create(&mut store.session(), definition)
        .unwrap();
}

fn step_of(engine: &TransitionEngine, store: &MemoryStore, item: NodeId) -> Option<String> {
    engine
        .current_step(&store.session(), item)
        .unwrap()
        .map(|s| s.step)
}

fn submission() -> WorkflowDefinition {
    WorkflowDefinition::new("submission")
        .with_description("Submit, review, publish")
        .with_step(Step::new("start", "start").with_true("review").with_true_label("Submit"))
        .with_step(
            Step::new("review", "wait")
                .with_true("end")
                .with_true_label("Accept")
                .with_false("start")
                .with_false_label("Reject"),
        )
        .with_step(
            Step::new("end", "end")
                .with_setting("endremove", "1")
                .with_setting("endtext", "Published"),
        )
}

#[test]
fn test_submission_round_trip_through_review() {
    let engine = builtin_engine();
    let store = MemoryStore::new();
    install(&engine, &store, submission());

    let mut session = store.session();
    let (item, entered) = engine
        .create_item(&mut session, "submission", "thesis", "document")
        .unwrap();
    assert_eq!(entered.step, "start");

    assert_eq!(engine.forward(&mut session, item, true).unwrap().step, "review");
    assert_eq!(engine.forward(&mut session, item, false).unwrap().step, "start");
    assert_eq!(engine.forward(&mut session, item, true).unwrap().step, "review");

    // end removes the item from containment on arrival
    let landed = engine.forward(&mut session, item, true).unwrap();
    assert_eq!(landed.step, "end");
    assert_eq!(step_of(&engine, &store, item), None);

    let result = engine.forward(&mut session, item, true);
    assert!(matches!(result, Err(WorkflowError::NotInWorkflow { .. })));
}

#[test]
fn test_item_is_held_by_exactly_one_step() {
    let engine = builtin_engine();
    let store = MemoryStore::new();
    install(&engine, &store, submission());

    let mut session = store.session();
    let (item, _) = engine
        .create_item(&mut session, "submission", "thesis", "document")
        .unwrap();

    for outcome in [true, false, true, false, true] {
        engine.forward(&mut session, item, outcome).unwrap();
        let parents = store.session().parents(item).unwrap();
        let step_parents: Vec<_> = parents
            .iter()
            .filter(|p| store.session().node(**p).unwrap().node_type == STEP_NODE_TYPE)
            .collect();
        assert_eq!(step_parents.len(), 1);
    }
}

#[test]
fn test_forward_and_render_after_end_reports_finish() {
    let engine = builtin_engine();
    let store = MemoryStore::new();
    install(&engine, &store, submission());

    let mut session = store.session();
    let (item, _) = engine
        .create_item(&mut session, "submission", "thesis", "document")
        .unwrap();
    engine.forward(&mut session, item, true).unwrap();

    let page = engine
        .forward_and_render(&mut session, item, true, &Request::new())
        .unwrap();
    assert_eq!(
        page,
        Page::Finished {
            item,
            workflow: "submission".to_string(),
            step: "end".to_string(),
        }
    );
}

#[test]
fn test_self_loop_keeps_item_in_place() {
    let engine = builtin_engine();
    let store = MemoryStore::new();
    install(
        &engine,
        &store,
        WorkflowDefinition::new("loop")
            .with_step(Step::new("start", "start").with_true("edit"))
            .with_step(Step::new("edit", "wait").with_true("end").with_false("edit"))
            .with_step(Step::new("end", "end")),
    );

    let mut session = store.session();
    let (item, _) = engine.create_item(&mut session, "loop", "draft", "document").unwrap();
    engine.forward(&mut session, item, true).unwrap();

    for _ in 0..3 {
        let landed = engine.forward(&mut session, item, false).unwrap();
        assert_eq!(landed.step, "edit");
        assert_eq!(step_of(&engine, &store, item).as_deref(), Some("edit"));
    }
}

#[test]
fn test_missing_branch_is_reported() {
    let engine = builtin_engine();
    let store = MemoryStore::new();
    install(&engine, &store, submission());

    let mut session = store.session();
    let (item, _) = engine
        .create_item(&mut session, "submission", "thesis", "document")
        .unwrap();

    let err = engine.forward(&mut session, item, false).unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::NoTransitionDefined { outcome: false, .. }
    ));
    assert!(err.is_configuration_error());
    assert_eq!(step_of(&engine, &store, item).as_deref(), Some("start"));
}

fn routing() -> WorkflowDefinition {
    WorkflowDefinition::new("routing")
        .with_step(Step::new("start", "start").with_true("check").with_true_label("Submit"))
        .with_step(
            Step::new("check", "condition")
                .with_setting("condition", "hasfile:pdf")
                .with_true("publish")
                .with_false("missing"),
        )
        .with_step(
            Step::new("missing", "wait")
                .with_true("check")
                .with_true_label("Retry"),
        )
        .with_step(
            Step::new("publish", "wait")
                .with_true("end")
                .with_true_label("Publish"),
        )
        .with_step(Step::new("end", "end"))
}

#[test]
fn test_condition_step_drives_item_onward() {
    let engine = builtin_engine();
    let store = MemoryStore::new();
    install(&engine, &store, routing());

    let mut session = store.session();
    let (item, _) = engine.create_item(&mut session, "routing", "paper", "document").unwrap();

    // The step transitioned into is the condition, but the item never stays there
    let landed = engine.forward(&mut session, item, true).unwrap();
    assert_eq!(landed.step, "check");
    assert_eq!(step_of(&engine, &store, item).as_deref(), Some("missing"));

    session.add_file(item, FileAttachment::new("paper.pdf", "pdf")).unwrap();
    session.commit().unwrap();

    let page = engine
        .forward_and_render(&mut session, item, true, &Request::new())
        .unwrap();
    match page {
        Page::Step(view) => {
            assert_eq!(view.step, "publish");
            assert_eq!(view.actions.len(), 1);
            assert_eq!(view.actions[0].label, "Publish");
        }
        other => panic!("expected publish view, got {:?}", other),
    }
}

/// Fails until the item carries `ready=yes`.
struct PublishStep;

impl StepBehavior for PublishStep {
    fn run_action(&self, ctx: &mut StepContext<'_>, _outcome: bool) -> Result<(), BehaviorError> {
        if ctx.get("ready")? != "yes" {
            return Err(BehaviorError::failed("item is not ready"));
        }
        ctx.set("published", "yes")?;
        ctx.commit()
    }
}

#[test]
fn test_behavior_failure_records_error_and_recovers() {
    let mut registry = StepRegistry::with_builtin_steps().unwrap();
    registry
        .register("publish", |_: &Step| Ok(Box::new(PublishStep) as Box<dyn StepBehavior>))
        .unwrap();
    let engine = engine_with(registry);
    let store = MemoryStore::new();
    install(
        &engine,
        &store,
        WorkflowDefinition::new("release")
            .with_step(Step::new("start", "start").with_true("publish"))
            .with_step(
                Step::new("publish", "workflowstep-publish")
                    .with_true("end")
                    .with_false("publish"),
            )
            .with_step(Step::new("end", "end")),
    );

    let mut session = store.session();
    let (item, _) = engine.create_item(&mut session, "release", "report", "document").unwrap();

    let err = engine.forward(&mut session, item, true).unwrap_err();
    match &err {
        WorkflowError::BehaviorExecution { step, message, .. } => {
            assert_eq!(step, "publish");
            assert_eq!(message, "item is not ready");
        }
        other => panic!("expected behavior failure, got {:?}", other),
    }

    // No rollback of the transition itself
    assert_eq!(step_of(&engine, &store, item).as_deref(), Some("publish"));

    let workflow_node = repository::find_workflow(&session, "release").unwrap().unwrap();
    let failed = repository::failed_items(&session, workflow_node).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].item.id, item);
    assert_eq!(failed[0].error_step, "publish");
    assert!(!failed[0].error_time.is_empty());

    session.set(item, "ready", "yes").unwrap();
    session.commit().unwrap();
    engine.forward(&mut session, item, false).unwrap();

    assert_eq!(session.get(item, "published").unwrap().as_deref(), Some("yes"));
    assert!(repository::failed_items(&session, workflow_node)
        .unwrap()
        .is_empty());
}

#[test]
fn test_uncommitted_behavior_changes_are_discarded() {
    struct Sloppy;
    impl StepBehavior for Sloppy {
        fn run_action(&self, ctx: &mut StepContext<'_>, _outcome: bool) -> Result<(), BehaviorError> {
            ctx.set("scratch", "lost")?;
            Ok(())
        }
    }

    let mut registry = StepRegistry::with_builtin_steps().unwrap();
    registry
        .register("sloppy", |_: &Step| Ok(Box::new(Sloppy) as Box<dyn StepBehavior>))
        .unwrap();
    let engine = engine_with(registry);
    let store = MemoryStore::new();
    install(
        &engine,
        &store,
        WorkflowDefinition::new("sloppy")
            .with_step(Step::new("start", "start").with_true("work"))
            .with_step(Step::new("work", "sloppy").with_true("end"))
            .with_step(Step::new("end", "end")),
    );

    let mut session = store.session();
    let (item, _) = engine.create_item(&mut session, "sloppy", "doc", "document").unwrap();
    engine.forward(&mut session, item, true).unwrap();

    assert!(!session.has_pending_changes());
    assert_eq!(store.session().get(item, "scratch").unwrap(), None);
    assert_eq!(step_of(&engine, &store, item).as_deref(), Some("work"));
}

#[test]
fn test_unrelated_commit_keeps_concurrent_transition() {
    let engine = builtin_engine();
    let store = MemoryStore::new();
    install(&engine, &store, submission());

    let (item, _) = engine
        .create_item(&mut store.session(), "submission", "thesis", "document")
        .unwrap();

    // An editing request stages a title before a reviewer moves the item
    let mut editor = store.session();
    editor.set(item, "title", "On Workflows").unwrap();

    let mut reviewer = store.session();
    assert_eq!(engine.forward(&mut reviewer, item, true).unwrap().step, "review");

    editor.commit().unwrap();

    assert_eq!(step_of(&engine, &store, item).as_deref(), Some("review"));
    assert_eq!(
        store.session().get(item, "title").unwrap().as_deref(),
        Some("On Workflows")
    );
}

#[test]
fn test_stale_session_forwards_from_current_step() {
    let engine = builtin_engine();
    let store = MemoryStore::new();
    install(&engine, &store, submission());

    let (item, _) = engine
        .create_item(&mut store.session(), "submission", "thesis", "document")
        .unwrap();

    let mut stale = store.session();
    stale.set(item, "title", "Draft").unwrap();

    engine.forward(&mut store.session(), item, true).unwrap();

    // Rejecting from review sends the item back; the staged title survives
    assert_eq!(engine.forward(&mut stale, item, false).unwrap().step, "start");
    stale.commit().unwrap();

    let holders = store
        .session()
        .containing_parents(item, STEP_NODE_TYPE)
        .unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(step_of(&engine, &store, item).as_deref(), Some("start"));
    assert_eq!(store.session().get(item, "title").unwrap().as_deref(), Some("Draft"));
}

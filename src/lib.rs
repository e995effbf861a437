//! docflow - Content Workflow Engine
//!
//! Moves content items through directed step graphs. Every step has at
//! most two outgoing branches (`true` and `false`); a step type attaches
//! behavior that runs when an item arrives and decides how the step is
//! rendered to a user.
//!
//! # Architecture
//!
//! - [`store`]: Content tree abstraction and the in-memory store
//! - [`workflow`]: Definitions, validation, persistence and transfer
//! - [`execution`]: Step registry, transition engine and concurrency guard
//! - [`steps`]: Built-in step behaviors
//! - [`access`]: Access gates consulted for interactive requests
//! - [`boundary`]: Request-level service used by the web layer
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use docflow::execution::{StepRegistry, TransitionEngine};
//! use docflow::store::MemoryStore;
//! use docflow::workflow::{Step, WorkflowDefinition};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(StepRegistry::with_builtin_steps()?);
//!     let engine = TransitionEngine::new(registry);
//!     let store = MemoryStore::new();
//!     let mut session = store.session();
//!
//!     let definition = WorkflowDefinition::new("submission")
//!         .with_step(Step::new("start", "start").with_true("end"))
//!         .with_step(Step::new("end", "end"));
//!     engine.repository().create(&mut session, definition)?;
//!
//!     let (item, _) = engine.create_item(&mut session, "submission", "thesis", "document")?;
//!     let landed = engine.forward(&mut session, item, true)?;
//!     assert_eq!(landed.step, "end");
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod boundary;
pub mod error;
pub mod execution;
pub mod steps;
pub mod store;
pub mod workflow;

// Re-export commonly used types
pub use boundary::WorkflowService;
pub use error::{WorkflowError, WorkflowResult};
pub use execution::{Page, Request, StepRegistry, TransitionEngine};
pub use workflow::model::{Step, WorkflowDefinition};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "docflow";

//! Workflow Execution Module
//!
//! Moves content items through workflow graphs and dispatches step
//! behaviors.
//!
//! # Architecture
//!
//! - [`engine`]: Transition engine advancing items along true/false edges
//! - [`behavior`]: Step behavior contract and the context handed to behaviors
//! - [`registry`]: Step type name to behavior factory mapping
//! - [`guard`]: Process-wide lock serializing all transitions
//! - [`page`]: Request and page types exchanged with the web layer

pub mod behavior;
pub mod engine;
pub mod guard;
pub mod page;
pub mod registry;

pub use behavior::{default_render, BehaviorError, StepBehavior, StepContext};
pub use engine::{EngineConfig, StepRef, TransitionEngine};
pub use guard::ConcurrencyGuard;
pub use page::{Action, Page, Request, StepView};
pub use registry::{BoundWorkflow, RegistryError, StepRegistry};

//! Interactive Boundary
//!
//! Entry points for the web layer: access checks around the engine and the
//! mapping of failures onto displayable pages.

pub mod service;

pub use service::WorkflowService;

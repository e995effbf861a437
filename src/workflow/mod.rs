//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, validating,
//! persisting and transferring workflow graphs.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (WorkflowDefinition, Step, Edge)
//! - [`validator`]: Graph validation rules
//! - [`parser`]: YAML definition files
//! - [`repository`]: Mapping definitions onto the content tree
//! - [`transfer`]: Export and import documents

pub mod model;
pub mod parser;
pub mod repository;
pub mod transfer;
pub mod validator;

pub use model::{AccessRules, Edge, Step, WorkflowDefinition};
pub use parser::{load_definition, parse_definition, save_definition};
pub use repository::{FailedItem, ItemSummary, WorkflowRepository};
pub use transfer::{export_workflows, import_document, ExportDocument, Format, TransferError};
pub use validator::{quick_validate, validate_definition, ValidationError};

//! Work and workflow definitions, plus the DAG resolver.

pub mod dag;
mod types;

pub use types::{parse_work, parse_workflow, WorkDefinition, WorkType, WorkflowDefinition};

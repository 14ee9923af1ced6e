//! DAG Workflow Engine (C6).
//!
//! `dag` builds and validates the task graph (including matrix expansion),
//! `parser` turns a YAML workflow definition into the types `dag` consumes,
//! and `engine` runs the scheduler loop described in section 4.6.

pub mod dag;
pub mod engine;
pub mod parser;

pub use dag::{Dag, Priority, Task, TaskMetadata};
pub use engine::{TaskResult, TaskStatus, WorkflowEngine, WorkflowOutcome, WorkflowStatus};
pub use parser::{parse_workflow_yaml, WorkflowDef};

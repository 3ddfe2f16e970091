//! Workflow execution.
//!
//! The executor replays one [`crate::workflows::LearnedWorkflow`] version
//! against a fresh automation context, strictly in step order, and reports
//! the outcome of every attempted step.

mod result;
mod runner;

pub use result::{ExecutionResult, ProgressEvent, StepResult};
pub use runner::{ExecutionOptions, ExecutionSignals, WorkflowExecutor};

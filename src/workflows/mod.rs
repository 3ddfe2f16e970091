//! Learned workflows: versioned step sequences and their store.
//!
//! - `model`: definitions, learned versions, steps and selectors
//! - `confidence`: the moving-average update applied after every execution
//! - `store`: versioned persistence with leases held by active jobs

pub mod confidence;
pub mod model;
pub mod store;

pub use model::{
    ElementSelector, LearnedWorkflow, NewWorkflow, SelectorKind, StepAction, WorkflowDefinition,
    WorkflowStep,
};
pub use store::{LeasedWorkflow, SelectorOutcome, WorkflowLease, WorkflowStore};

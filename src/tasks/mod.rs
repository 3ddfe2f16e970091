//! Tasks: the unit of work callers submit, and the orchestrator that runs them.

pub mod handler;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod workflow_handler;

pub use handler::{HandlerRegistry, TaskContext, TaskHandler};
pub use model::{
    AutomationOptions, Task, TaskEvent, TaskFilter, TaskPayload, TaskPriority, TaskStatus, TaskSubmission, TaskType,
};
pub use orchestrator::{Orchestrator, spawn_dispatcher, spawn_retention_sweep};
pub use workflow_handler::WorkflowTaskHandler;

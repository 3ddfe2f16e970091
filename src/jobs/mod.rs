//! Active jobs: tracked, pausable, cancellable workflow executions.

mod manager;
mod model;

pub use manager::{JobManager, spawn_job_cleanup};
pub use model::{
    ActiveJob, JobEvent, JobFilter, JobLogEntry, JobParams, JobProgress, JobStatistics, JobStatus,
    LogLevel, WorkflowJobStats,
};

//! Worker pool: per-platform workers, their state machine and reports.

pub mod pool;
pub mod report;
pub mod state;

pub use pool::{BulkOutcome, PoolStatistics, WorkerPool};
pub use report::WorkerReport;
pub use state::{StopMode, WorkerInfo, WorkerState};

//! Social Autopilot: automation core for teach-by-demonstration social media
//! workflows.
//!
//! A human demonstrates a task once in a recorded browser session; the
//! recording becomes a versioned workflow that workers replay on demand as
//! tracked, controllable jobs.

pub mod automation;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod knowledge;
pub mod platform;
pub mod store;
pub mod tasks;
pub mod teaching;
pub mod telemetry;
pub mod testing;
pub mod workers;
pub mod workflows;

pub use config::EngineConfig;
pub use engine::{Engine, EngineDeps};
pub use error::{AutomationError, Error, Result};
pub use platform::Platform;

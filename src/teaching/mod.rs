//! Teach-by-demonstration.
//!
//! - `session`: teaching session state and its lifecycle
//! - `recorder`: drives an automation context while a human demonstrates
//! - `learning`: converts recorded actions into a workflow version

pub mod learning;
pub mod recorder;
pub mod session;

pub use learning::LearningEngine;
pub use recorder::{TeachingRecorder, spawn_session_expiry};
pub use session::{SessionStatus, StartSession, TeachingSession, TeachingStep};

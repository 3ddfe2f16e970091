//! Worker state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::platform::Platform;

/// State of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Ready for a task.
    Idle,
    /// Executing a task.
    Running,
    /// Takes no new tasks; an in-flight task keeps running.
    Paused,
    /// Shut down for good.
    Stopped,
    /// Faulted; needs a resume after remediation.
    Error,
}

impl WorkerState {
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            // From Idle
            (Idle, Running) | (Idle, Paused) | (Idle, Stopped) |
            // From Running
            (Running, Idle) | (Running, Paused) | (Running, Error) | (Running, Stopped) |
            // From Paused
            (Paused, Idle) | (Paused, Running) | (Paused, Error) | (Paused, Stopped) |
            // From Error (resume after remediation)
            (Error, Idle) | (Error, Stopped)
        )
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// How to stop a worker with a task in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// Wait for the current task to finish.
    Graceful,
    /// Cancel the current task and stop now.
    Forced,
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: Uuid,
    pub name: String,
    pub platform: Platform,
    pub state: WorkerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<Uuid>,
    /// Progress of the current task, 0..=100.
    pub progress: u8,
    pub tasks_processed: u64,
    pub success_count: u64,
    pub failure_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// A graceful stop is waiting for the current task.
    #[serde(default)]
    pub stopping: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<DateTime<Utc>>,
}

impl WorkerInfo {
    pub fn new(name: impl Into<String>, platform: Platform) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            platform,
            state: WorkerState::Idle,
            current_task: None,
            progress: 0,
            tasks_processed: 0,
            success_count: 0,
            failure_count: 0,
            last_error: None,
            stopping: false,
            created_at: Utc::now(),
            last_active_at: None,
        }
    }

    pub fn transition_to(&mut self, state: WorkerState) -> Result<()> {
        if self.state == state {
            return Ok(());
        }
        if !self.state.can_transition_to(state) {
            return Err(Error::conflict("worker", &self.name, self.state, format!("move to {state}")));
        }
        self.state = state;
        Ok(())
    }

    /// Free for a new task.
    pub fn can_take_task(&self) -> bool {
        self.state.is_available() && !self.stopping && self.current_task.is_none()
    }

    pub fn success_rate(&self) -> f64 {
        match self.tasks_processed {
            0 => 0.0,
            n => self.success_count as f64 / n as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        use WorkerState::*;

        assert!(Idle.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Idle));
        assert!(Error.can_transition_to(Idle));
        assert!(!Error.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Error));
    }

    #[test]
    fn stopped_workers_stay_stopped() {
        let mut w = WorkerInfo::new("fb-1", Platform::Facebook);
        w.transition_to(WorkerState::Stopped).unwrap();
        assert!(w.transition_to(WorkerState::Idle).is_err());
        assert!(!w.can_take_task());
    }

    #[test]
    fn success_rate_is_zero_without_tasks() {
        let mut w = WorkerInfo::new("fb-1", Platform::Facebook);
        assert_eq!(w.success_rate(), 0.0);
        w.tasks_processed = 4;
        w.success_count = 3;
        assert!((w.success_rate() - 0.75).abs() < 1e-9);
    }
}

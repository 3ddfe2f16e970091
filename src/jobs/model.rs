//! Active job state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::automation::ExecutionContent;
use crate::error::{Error, Result};
use crate::executor::ExecutionResult;
use crate::platform::Platform;

/// State of an active job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a concurrency slot.
    Pending,
    Running,
    /// Holding at the next step boundary.
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Running) | (Pending, Cancelled) | (Pending, Failed) |
            // From Running
            (Running, Paused) | (Running, Completed) | (Running, Failed) | (Running, Cancelled) |
            // From Paused (the in-flight step may still finish the run)
            (Paused, Running) | (Paused, Completed) | (Paused, Failed) | (Paused, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Step progress of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// 0..=100
    pub percentage: u8,
    /// Steps finished so far; never exceeds `total_steps`.
    pub current_step: u32,
    pub total_steps: u32,
    pub logs: Vec<JobLogEntry>,
}

impl JobProgress {
    pub fn new(total_steps: u32) -> Self {
        Self {
            total_steps,
            ..Self::default()
        }
    }

    /// Record `finished` completed steps.
    pub fn advance(&mut self, finished: u32) {
        self.current_step = finished.min(self.total_steps);
        self.percentage = match self.total_steps {
            0 => 100,
            total => ((self.current_step as u64 * 100) / total as u64).min(100) as u8,
        };
    }

    /// Append a log line, dropping the oldest past `cap`.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>, cap: usize) {
        self.logs.push(JobLogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
        if self.logs.len() > cap {
            let drain_count = self.logs.len() - cap;
            self.logs.drain(..drain_count);
        }
    }
}

/// One execution of one workflow version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveJob {
    pub id: Uuid,
    pub workflow_id: String,
    pub workflow_version: u32,
    pub platform: Platform,
    pub user_id: String,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActiveJob {
    pub fn transition_to(&mut self, status: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(status) {
            return Err(Error::conflict("job", self.id, self.status, format!("move to {status}")));
        }
        self.status = status;
        match status {
            JobStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        Ok(())
    }
}

/// Options for [`crate::jobs::JobManager::start_job`].
#[derive(Debug, Clone, Default)]
pub struct JobParams {
    /// Specific version; the current one when `None`.
    pub version: Option<u32>,
    pub content: ExecutionContent,
    pub dry_run: bool,
    /// Without an explicit version, run the highest-confidence version.
    pub prefer_confident: bool,
}

/// Filter for [`crate::jobs::JobManager::list_jobs`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub workflow_id: Option<String>,
    pub user_id: Option<String>,
}

impl JobFilter {
    pub fn matches(&self, job: &ActiveJob) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.workflow_id.as_ref().is_none_or(|w| &job.workflow_id == w)
            && self.user_id.as_ref().is_none_or(|u| &job.user_id == u)
    }
}

/// Job lifecycle notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Created {
        job_id: Uuid,
        workflow_id: String,
        version: u32,
    },
    StatusChanged {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
    Progress {
        job_id: Uuid,
        current_step: u32,
        total_steps: u32,
        percentage: u8,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkflowJobStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Summary of all jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStatistics {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub by_workflow: BTreeMap<String, WorkflowJobStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        use JobStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Paused));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Cancelled));
        assert!(Failed.is_terminal());
        assert!(Paused.is_active());
    }

    #[test]
    fn progress_stays_in_bounds() {
        let mut p = JobProgress::new(3);
        p.advance(1);
        assert_eq!((p.current_step, p.percentage), (1, 33));
        p.advance(7);
        assert_eq!((p.current_step, p.percentage), (3, 100));

        let mut empty = JobProgress::new(0);
        empty.advance(1);
        assert_eq!((empty.current_step, empty.percentage), (0, 100));
    }

    #[test]
    fn log_is_capped() {
        let mut p = JobProgress::new(1);
        for i in 0..10 {
            p.log(LogLevel::Info, format!("line {i}"), 4);
        }
        assert_eq!(p.logs.len(), 4);
        assert_eq!(p.logs[0].message, "line 6");
    }
}

//! Worker reports: one entry per finished task.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::platform::Platform;
use crate::tasks::TaskType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub worker_name: String,
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub platform: Platform,
    pub success: bool,
    pub cancelled: bool,
    /// The handler faulted (error or panic) and the worker moved to Error.
    pub fault: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Bounded report history, newest first.
#[derive(Debug)]
pub struct ReportLog {
    entries: VecDeque<WorkerReport>,
    capacity: usize,
}

impl ReportLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, report: WorkerReport) {
        self.entries.push_front(report);
        self.entries.truncate(self.capacity);
    }

    /// Newest reports first, optionally for one worker.
    pub fn query(&self, limit: usize, worker_id: Option<Uuid>) -> Vec<WorkerReport> {
        self.entries
            .iter()
            .filter(|r| worker_id.is_none_or(|id| r.worker_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(worker_id: Uuid, n: u32) -> WorkerReport {
        let now = Utc::now();
        WorkerReport {
            id: Uuid::new_v4(),
            worker_id,
            worker_name: format!("w-{n}"),
            task_id: Uuid::new_v4(),
            task_type: TaskType::PostContent,
            platform: Platform::Facebook,
            success: true,
            cancelled: false,
            fault: false,
            error: None,
            output: None,
            started_at: now,
            finished_at: now,
            duration_ms: n as u64,
        }
    }

    #[test]
    fn bounded_and_newest_first() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut log = ReportLog::new(3);
        for n in 0..5 {
            log.push(report(if n % 2 == 0 { a } else { b }, n));
        }
        assert_eq!(log.len(), 3);

        let all = log.query(10, None);
        let order: Vec<u64> = all.iter().map(|r| r.duration_ms).collect();
        assert_eq!(order, vec![4, 3, 2]);

        let only_a = log.query(10, Some(a));
        assert_eq!(only_a.len(), 2);
        assert_eq!(log.query(1, None).len(), 1);
    }
}

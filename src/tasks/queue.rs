//! Bounded pending-task queue ordered for dispatch.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::tasks::model::{Task, TaskPriority};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub id: Uuid,
    pub platform: Platform,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    /// Submission sequence number; breaks timestamp ties.
    pub seq: u64,
}

impl Ord for QueuedTask {
    // Max-heap: the greatest element dispatches first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
pub struct PendingQueue {
    heap: BinaryHeap<QueuedTask>,
    capacity: usize,
    next_seq: u64,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            capacity,
            next_seq: 0,
        }
    }

    /// Reject rather than block when full.
    pub fn ensure_capacity(&self) -> Result<()> {
        if self.heap.len() >= self.capacity {
            return Err(Error::CapacityExceeded {
                what: "pending tasks",
                max: self.capacity,
            });
        }
        Ok(())
    }

    pub fn push(&mut self, task: &Task) -> Result<()> {
        self.ensure_capacity()?;
        self.next_seq += 1;
        self.heap.push(QueuedTask {
            id: task.id,
            platform: task.platform,
            priority: task.priority,
            created_at: task.created_at,
            seq: self.next_seq,
        });
        Ok(())
    }

    /// Put back an entry taken by [`Self::drain_ordered`]. Keeps its original place.
    pub fn requeue(&mut self, entry: QueuedTask) {
        self.heap.push(entry);
    }

    /// Take every entry, highest dispatch precedence first.
    pub fn drain_ordered(&mut self) -> Vec<QueuedTask> {
        std::mem::take(&mut self.heap).into_sorted_vec().into_iter().rev().collect()
    }

    pub fn remove(&mut self, id: Uuid) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.id != id);
        self.heap.len() != before
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::tasks::model::{AutomationOptions, TaskPayload, TaskStatus, TaskType};

    fn task(priority: TaskPriority, created_at: DateTime<Utc>) -> Task {
        Task {
            id: Uuid::new_v4(),
            task_type: TaskType::JoinGroups,
            platform: Platform::Facebook,
            user_id: "u1".into(),
            brand_id: None,
            payload: TaskPayload::JoinGroups {
                group_urls: vec!["g".into()],
                options: AutomationOptions::default(),
            },
            priority,
            status: TaskStatus::Pending,
            progress: 0,
            worker_id: None,
            created_at,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    #[test]
    fn priority_then_age_then_sequence() {
        let now = Utc::now();
        let old_normal = task(TaskPriority::Normal, now - Duration::seconds(10));
        let new_normal = task(TaskPriority::Normal, now);
        let same_time = task(TaskPriority::Normal, now);
        let urgent = task(TaskPriority::Urgent, now);
        let low = task(TaskPriority::Low, now - Duration::seconds(60));

        let mut q = PendingQueue::new(10);
        for t in [&low, &new_normal, &same_time, &urgent, &old_normal] {
            q.push(t).unwrap();
        }

        let order: Vec<Uuid> = q.drain_ordered().into_iter().map(|e| e.id).collect();
        assert_eq!(order, vec![urgent.id, old_normal.id, new_normal.id, same_time.id, low.id]);
        assert!(q.is_empty());
    }

    #[test]
    fn full_queue_rejects() {
        let mut q = PendingQueue::new(1);
        q.push(&task(TaskPriority::Normal, Utc::now())).unwrap();
        let err = q.push(&task(TaskPriority::Urgent, Utc::now())).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { max: 1, .. }));
    }

    #[test]
    fn remove_and_requeue() {
        let mut q = PendingQueue::new(5);
        let a = task(TaskPriority::Normal, Utc::now());
        let b = task(TaskPriority::High, Utc::now());
        q.push(&a).unwrap();
        q.push(&b).unwrap();

        assert!(q.remove(a.id));
        assert!(!q.remove(a.id));

        let drained = q.drain_ordered();
        assert_eq!(drained.len(), 1);
        q.requeue(drained[0].clone());
        assert_eq!(q.len(), 1);
    }
}

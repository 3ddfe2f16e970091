//! Task handlers and their registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::tasks::model::{Task, TaskType};

/// What a handler sees while it runs a task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub worker_id: Uuid,
    /// Fires on task cancellation or a forced worker stop.
    pub cancel: CancellationToken,
    progress: Arc<AtomicU8>,
}

impl TaskContext {
    pub fn new(task_id: Uuid, worker_id: Uuid, cancel: CancellationToken, progress: Arc<AtomicU8>) -> Self {
        Self {
            task_id,
            worker_id,
            cancel,
            progress,
        }
    }

    /// Report progress, clamped to 100.
    pub fn set_progress(&self, percentage: u8) {
        self.progress.store(percentage.min(100), Ordering::Relaxed);
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Runs tasks of one type.
///
/// Return `Error::ExecutionFault` for failures that mean the worker itself is
/// unhealthy; any other error only fails the task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> TaskType;

    async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<serde_json::Value>;
}

/// Handlers keyed by task type.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<TaskType, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler, replacing any previous one for its type.
    pub async fn register(&self, handler: Arc<dyn TaskHandler>) {
        let task_type = handler.task_type();
        if self.handlers.write().await.insert(task_type, handler).is_some() {
            tracing::warn!(%task_type, "Replaced task handler");
        } else {
            tracing::debug!(%task_type, "Registered task handler");
        }
    }

    pub async fn unregister(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.write().await.remove(&task_type)
    }

    pub async fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(&task_type).cloned()
    }

    pub async fn has(&self, task_type: TaskType) -> bool {
        self.handlers.read().await.contains_key(&task_type)
    }

    pub async fn list(&self) -> Vec<TaskType> {
        self.handlers.read().await.keys().copied().collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

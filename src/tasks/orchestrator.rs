//! Task orchestrator: accepts tasks, queues them and dispatches them to workers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::store::{KeyedStore, MemoryStore};
use crate::tasks::handler::{HandlerRegistry, TaskHandler};
use crate::tasks::model::{Task, TaskEvent, TaskFilter, TaskStatus, TaskSubmission};
use crate::tasks::queue::PendingQueue;
use crate::workers::WorkerPool;

pub struct Orchestrator {
    tasks: Arc<dyn KeyedStore<Uuid, Task>>,
    queue: tokio::sync::Mutex<PendingQueue>,
    handlers: Arc<HandlerRegistry>,
    pool: Arc<WorkerPool>,
    /// Cancellation tokens of running tasks.
    running: Mutex<HashMap<Uuid, CancellationToken>>,
    events: broadcast::Sender<TaskEvent>,
}

impl Orchestrator {
    pub fn new(handlers: Arc<HandlerRegistry>, pool: Arc<WorkerPool>, config: &OrchestratorConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            tasks: Arc::new(MemoryStore::new("task")),
            queue: tokio::sync::Mutex::new(PendingQueue::new(config.max_pending_tasks)),
            handlers,
            pool,
            running: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn running(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Validate and enqueue a task. Returns the task as submitted; it may
    /// already be running by the time the caller looks again.
    pub async fn submit(self: &Arc<Self>, submission: TaskSubmission) -> Result<Task> {
        submission.validate()?;
        if !self.handlers.has(submission.task_type).await {
            return Err(Error::Validation(format!(
                "no handler registered for {}",
                submission.task_type
            )));
        }

        let task = Task {
            id: Uuid::new_v4(),
            task_type: submission.task_type,
            platform: submission.platform,
            user_id: submission.user_id,
            brand_id: submission.brand_id,
            payload: submission.payload,
            priority: submission.priority,
            status: TaskStatus::Pending,
            progress: 0,
            worker_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        };

        {
            let mut queue = self.queue.lock().await;
            queue.ensure_capacity()?;
            self.tasks.insert(task.id, task.clone()).await?;
            queue.push(&task)?;
        }

        tracing::info!(
            task_id = %task.id,
            task_type = %task.task_type,
            platform = %task.platform,
            priority = ?task.priority,
            "Task submitted"
        );
        self.publish(TaskEvent::Submitted {
            task_id: task.id,
            task_type: task.task_type,
            platform: task.platform,
        });

        self.dispatch_pending().await;
        Ok(task)
    }

    async fn with_live_progress(&self, mut task: Task) -> Task {
        if task.status == TaskStatus::Running
            && let Some(worker_id) = task.worker_id
            && let Ok(worker) = self.pool.get(worker_id).await
            && worker.current_task == Some(task.id)
        {
            task.progress = worker.progress;
        }
        task
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Task> {
        let task = self
            .tasks
            .get(&task_id)
            .await
            .ok_or_else(|| Error::not_found("task", task_id))?;
        Ok(self.with_live_progress(task).await)
    }

    /// Matching tasks, oldest first.
    pub async fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .snapshot()
            .await
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();
        tasks.sort_by_key(|t| t.created_at);

        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            out.push(self.with_live_progress(task).await);
        }
        out
    }

    /// Cancel a task. Returns `false` when it already finished or a cancel is
    /// already in flight.
    pub async fn cancel(&self, task_id: Uuid) -> Result<bool> {
        // The queue lock keeps dispatch from starting the task under us.
        let mut queue = self.queue.lock().await;
        let task = self
            .tasks
            .get(&task_id)
            .await
            .ok_or_else(|| Error::not_found("task", task_id))?;

        match task.status {
            TaskStatus::Pending => {
                queue.remove(task_id);
                drop(queue);
                self.tasks
                    .update(
                        &task_id,
                        Box::new(|t: &mut Task| {
                            t.transition_to(TaskStatus::Cancelled)?;
                            t.error = Some("task cancelled".to_string());
                            Ok(())
                        }),
                    )
                    .await?;
                tracing::info!(task_id = %task_id, "Pending task cancelled");
                self.publish(TaskEvent::Finished {
                    task_id,
                    status: TaskStatus::Cancelled,
                });
                Ok(true)
            }
            TaskStatus::Running => {
                drop(queue);
                let running = self.running();
                match running.get(&task_id) {
                    Some(token) if !token.is_cancelled() => {
                        token.cancel();
                        tracing::info!(task_id = %task_id, "Cancellation requested for running task");
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            }
            _ => Ok(false),
        }
    }

    /// Hand queued tasks to idle workers. Returns how many started.
    pub async fn dispatch_pending(self: &Arc<Self>) -> usize {
        let mut queue = self.queue.lock().await;
        if queue.is_empty() {
            return 0;
        }

        let mut saturated: HashSet<Platform> = HashSet::new();
        let mut dispatched = 0;

        for entry in queue.drain_ordered() {
            if saturated.contains(&entry.platform) {
                queue.requeue(entry);
                continue;
            }
            let Some(task) = self.tasks.get(&entry.id).await else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }

            let Some(handler) = self.handlers.get(task.task_type).await else {
                let reason = format!("no handler registered for {}", task.task_type);
                tracing::warn!(task_id = %task.id, %reason, "Dropping queued task");
                let dropped = self
                    .tasks
                    .update(
                        &task.id,
                        Box::new(move |t: &mut Task| {
                            t.transition_to(TaskStatus::Cancelled)?;
                            t.error = Some(reason);
                            Ok(())
                        }),
                    )
                    .await;
                if dropped.is_ok() {
                    self.publish(TaskEvent::Finished {
                        task_id: task.id,
                        status: TaskStatus::Cancelled,
                    });
                }
                continue;
            };

            let Some(worker_id) = self.pool.claim(entry.platform, entry.id).await else {
                saturated.insert(entry.platform);
                queue.requeue(entry);
                continue;
            };

            let cancel = CancellationToken::new();
            self.running().insert(task.id, cancel.clone());
            let started = self
                .tasks
                .update(
                    &task.id,
                    Box::new(move |t: &mut Task| {
                        t.transition_to(TaskStatus::Running)?;
                        t.worker_id = Some(worker_id);
                        t.progress = 0;
                        Ok(())
                    }),
                )
                .await;

            match started {
                Ok(task) => {
                    tracing::info!(task_id = %task.id, worker_id = %worker_id, "Task dispatched");
                    self.publish(TaskEvent::Started {
                        task_id: task.id,
                        worker_id,
                    });
                    let orchestrator = Arc::clone(self);
                    tokio::spawn(orchestrator.run_task(task, worker_id, handler, cancel));
                    dispatched += 1;
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "Failed to start task");
                    self.running().remove(&task.id);
                    self.pool.release_claim(worker_id).await;
                }
            }
        }

        dispatched
    }

    async fn run_task(
        self: Arc<Self>,
        task: Task,
        worker_id: Uuid,
        handler: Arc<dyn TaskHandler>,
        cancel: CancellationToken,
    ) {
        let result = self.pool.execute(worker_id, &task, handler, cancel.clone()).await;
        self.running().remove(&task.id);

        let cancelled = cancel.is_cancelled();
        let status = match (&result, cancelled) {
            (_, true) => TaskStatus::Cancelled,
            (Ok(_), false) => TaskStatus::Completed,
            (Err(_), false) => TaskStatus::Failed,
        };
        if let Err(e) = &result {
            tracing::warn!(task_id = %task.id, %status, error = %e, "Task did not complete");
        } else {
            tracing::info!(task_id = %task.id, %status, "Task finished");
        }

        let finished = self
            .tasks
            .update(
                &task.id,
                Box::new(move |t: &mut Task| {
                    t.transition_to(status)?;
                    match result {
                        Ok(value) => {
                            t.result = Some(value);
                            if status == TaskStatus::Completed {
                                t.progress = 100;
                            }
                        }
                        Err(e) => {
                            t.result = e.details();
                            t.error = Some(e.to_string());
                        }
                    }
                    if status == TaskStatus::Cancelled && t.error.is_none() {
                        t.error = Some("task cancelled".to_string());
                    }
                    Ok(())
                }),
            )
            .await;

        match finished {
            Ok(_) => self.publish(TaskEvent::Finished {
                task_id: task.id,
                status,
            }),
            Err(e) => tracing::warn!(task_id = %task.id, error = %e, "Failed to finalize task"),
        }
    }

    /// Drop terminal tasks that finished more than `retention` ago.
    pub async fn purge_finished(&self, retention: Duration) -> usize {
        let now = Utc::now();
        let removed = self
            .tasks
            .remove_where(&move |t: &Task| {
                t.status.is_terminal()
                    && t
                        .completed_at
                        .is_some_and(|at| (now - at).to_std().unwrap_or_default() >= retention)
            })
            .await;
        if !removed.is_empty() {
            tracing::debug!(purged = removed.len(), "Purged finished tasks");
        }
        removed.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Task events as a stream; lagged events are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = TaskEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| event.ok())
    }

    /// Cancel every running task.
    pub fn cancel_running(&self) {
        for token in self.running().values() {
            token.cancel();
        }
    }
}

/// Dispatch whenever a worker frees up, and on every tick as a fallback.
pub fn spawn_dispatcher(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let released = orchestrator.pool.released();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = released.notified() => {}
                _ = ticker.tick() => {}
            }
            orchestrator.dispatch_pending().await;
        }
        tracing::debug!("Dispatcher stopped");
    })
}

pub fn spawn_retention_sweep(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    retention: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    orchestrator.purge_finished(retention).await;
                }
            }
        }
    })
}

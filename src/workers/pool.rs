//! Worker pool: owns the workers and runs one task at a time on each.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{WorkerPoolConfig, WorkerSpec};
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::store::{KeyedStore, MemoryStore};
use crate::tasks::{Task, TaskContext, TaskHandler};
use crate::workers::report::{ReportLog, WorkerReport};
use crate::workers::state::{StopMode, WorkerInfo, WorkerState};

/// Run-time handles for one worker.
struct WorkerControl {
    /// `true` while a task is executing.
    busy: watch::Sender<bool>,
    /// Cancels the current task.
    cancel: Option<CancellationToken>,
    progress: Arc<AtomicU8>,
}

impl WorkerControl {
    fn new() -> Self {
        Self {
            busy: watch::channel(false).0,
            cancel: None,
            progress: Arc::new(AtomicU8::new(0)),
        }
    }
}

/// Result of a bulk operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkOutcome {
    pub succeeded: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
}

impl BulkOutcome {
    fn collect(results: Vec<(Uuid, Result<WorkerInfo>)>) -> Self {
        let mut outcome = Self::default();
        for (id, result) in results {
            match result {
                Ok(_) => outcome.succeeded.push(id),
                Err(e) => outcome.failed.push((id, e.to_string())),
            }
        }
        outcome
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Aggregate pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStatistics {
    pub total_workers: usize,
    pub idle: usize,
    pub running: usize,
    pub paused: usize,
    pub stopped: usize,
    pub error: usize,
    pub tasks_processed: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// success / processed, 0 when nothing was processed.
    pub success_rate: f64,
    pub by_platform: BTreeMap<Platform, usize>,
}

pub struct WorkerPool {
    workers: Arc<dyn KeyedStore<Uuid, WorkerInfo>>,
    controls: Mutex<HashMap<Uuid, WorkerControl>>,
    /// Registered worker names; claimed before the worker is stored.
    names: Mutex<HashSet<String>>,
    reports: Mutex<ReportLog>,
    /// Signalled whenever a worker may have become available.
    released: Arc<Notify>,
}

impl WorkerPool {
    pub fn new(config: &WorkerPoolConfig) -> Self {
        Self {
            workers: Arc::new(MemoryStore::new("worker")),
            controls: Mutex::new(HashMap::new()),
            names: Mutex::new(HashSet::new()),
            reports: Mutex::new(ReportLog::new(config.max_reports)),
            released: Arc::new(Notify::new()),
        }
    }

    fn controls(&self) -> MutexGuard<'_, HashMap<Uuid, WorkerControl>> {
        self.controls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn names(&self) -> MutexGuard<'_, HashSet<String>> {
        self.names.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reports_log(&self) -> MutexGuard<'_, ReportLog> {
        self.reports.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Notified when a worker frees up.
    pub fn released(&self) -> Arc<Notify> {
        Arc::clone(&self.released)
    }

    fn fill_progress(&self, mut info: WorkerInfo) -> WorkerInfo {
        if info.current_task.is_some()
            && let Some(control) = self.controls().get(&info.id)
        {
            info.progress = control.progress.load(Ordering::Relaxed);
        }
        info
    }

    /// Create the configured workers.
    pub async fn initialize(&self, specs: &[WorkerSpec]) -> Result<Vec<WorkerInfo>> {
        let mut created = Vec::with_capacity(specs.len());
        for spec in specs {
            created.push(self.register(&spec.name, spec.platform).await?);
        }
        tracing::info!(workers = created.len(), "Worker pool initialized");
        Ok(created)
    }

    pub async fn register(&self, name: &str, platform: Platform) -> Result<WorkerInfo> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("worker name must not be empty".to_string()));
        }
        if !self.names().insert(name.to_string()) {
            return Err(Error::conflict("worker", name, "already registered", "register"));
        }

        let info = WorkerInfo::new(name, platform);
        self.controls().insert(info.id, WorkerControl::new());
        if let Err(e) = self.workers.insert(info.id, info.clone()).await {
            self.controls().remove(&info.id);
            self.names().remove(name);
            return Err(e);
        }
        tracing::info!(worker_id = %info.id, name = %info.name, %platform, "Worker registered");
        self.released.notify_one();
        Ok(info)
    }

    /// Remove a worker, cancelling any task it is running.
    pub async fn remove(&self, worker_id: Uuid) -> Result<WorkerInfo> {
        let control = self.controls().remove(&worker_id);
        if let Some(token) = control.and_then(|c| c.cancel) {
            token.cancel();
        }
        let info = self
            .workers
            .remove(&worker_id)
            .await
            .ok_or_else(|| Error::not_found("worker", worker_id))?;
        self.names().remove(&info.name);
        tracing::info!(worker_id = %worker_id, name = %info.name, "Worker removed");
        Ok(info)
    }

    pub async fn get(&self, worker_id: Uuid) -> Result<WorkerInfo> {
        let info = self
            .workers
            .get(&worker_id)
            .await
            .ok_or_else(|| Error::not_found("worker", worker_id))?;
        Ok(self.fill_progress(info))
    }

    /// All workers, in registration order.
    pub async fn list(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self
            .workers
            .snapshot()
            .await
            .into_iter()
            .map(|w| self.fill_progress(w))
            .collect();
        workers.sort_by_key(|w| w.created_at);
        workers
    }

    /// Atomically hand `task_id` to an idle worker for `platform`.
    pub async fn claim(&self, platform: Platform, task_id: Uuid) -> Option<Uuid> {
        let mut candidates: Vec<WorkerInfo> = self
            .workers
            .snapshot()
            .await
            .into_iter()
            .filter(|w| w.platform == platform && w.can_take_task())
            .collect();
        candidates.sort_by_key(|w| w.created_at);

        for candidate in candidates {
            let claimed = self
                .workers
                .update(
                    &candidate.id,
                    Box::new(move |w: &mut WorkerInfo| {
                        if !w.can_take_task() {
                            return Err(Error::conflict("worker", &w.name, w.state, "take a task"));
                        }
                        w.transition_to(WorkerState::Running)?;
                        w.current_task = Some(task_id);
                        w.progress = 0;
                        Ok(())
                    }),
                )
                .await;
            if claimed.is_ok() {
                if let Some(control) = self.controls().get(&candidate.id) {
                    control.busy.send_replace(true);
                    control.progress.store(0, Ordering::Relaxed);
                }
                return Some(candidate.id);
            }
        }
        None
    }

    /// Undo a claim whose task never started.
    pub async fn release_claim(&self, worker_id: Uuid) {
        let _ = self
            .workers
            .update(
                &worker_id,
                Box::new(|w: &mut WorkerInfo| {
                    w.current_task = None;
                    if w.state == WorkerState::Running {
                        w.transition_to(WorkerState::Idle)?;
                    }
                    Ok(())
                }),
            )
            .await;
        if let Some(control) = self.controls().get(&worker_id) {
            control.busy.send_replace(false);
        }
        self.released.notify_one();
    }

    /// Run a claimed task on its worker. Panics and `ExecutionFault`s move the
    /// worker to Error; the task's own outcome is returned either way.
    pub async fn execute(
        &self,
        worker_id: Uuid,
        task: &Task,
        handler: Arc<dyn TaskHandler>,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        let progress = {
            let mut controls = self.controls();
            let control = controls.entry(worker_id).or_insert_with(WorkerControl::new);
            control.cancel = Some(cancel.clone());
            control.progress.store(0, Ordering::Relaxed);
            control.busy.send_replace(true);
            Arc::clone(&control.progress)
        };
        let ctx = TaskContext::new(task.id, worker_id, cancel.clone(), progress);

        let started_at = Utc::now();
        let clock = Instant::now();
        tracing::info!(
            worker_id = %worker_id,
            task_id = %task.id,
            task_type = %task.task_type,
            "Worker started task"
        );

        let outcome = AssertUnwindSafe(handler.handle(task, &ctx)).catch_unwind().await;
        let (result, fault) = match outcome {
            Ok(Ok(value)) => (Ok(value), false),
            Ok(Err(e)) => {
                let fault = e.is_fault();
                (Err(e), fault)
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                (Err(Error::ExecutionFault(format!("handler panicked: {message}"))), true)
            }
        };

        let cancelled = cancel.is_cancelled();
        // A task torn down by cancellation says nothing about the worker's health.
        let fault = fault && !cancelled;
        let success = result.is_ok() && !cancelled;
        let error = result.as_ref().err().map(|e| e.to_string());

        let last_error = error.clone();
        let updated = self
            .workers
            .update(
                &worker_id,
                Box::new(move |w: &mut WorkerInfo| {
                    w.tasks_processed += 1;
                    if success {
                        w.success_count += 1;
                    } else if !cancelled {
                        w.failure_count += 1;
                    }
                    if last_error.is_some() {
                        w.last_error = last_error;
                    }
                    w.current_task = None;
                    w.progress = 0;
                    w.last_active_at = Some(Utc::now());
                    let next = match w.state {
                        WorkerState::Stopped => WorkerState::Stopped,
                        _ if fault => WorkerState::Error,
                        WorkerState::Paused => WorkerState::Paused,
                        WorkerState::Error => WorkerState::Error,
                        _ => WorkerState::Idle,
                    };
                    w.transition_to(next)
                }),
            )
            .await;

        {
            let mut controls = self.controls();
            if let Some(control) = controls.get_mut(&worker_id) {
                control.cancel = None;
                control.busy.send_replace(false);
            }
        }

        let worker_name = match &updated {
            Ok(info) => info.name.clone(),
            Err(_) => String::new(),
        };
        if fault {
            tracing::error!(
                worker_id = %worker_id,
                task_id = %task.id,
                error = error.as_deref().unwrap_or_default(),
                "Worker faulted"
            );
        } else {
            tracing::info!(
                worker_id = %worker_id,
                task_id = %task.id,
                success,
                cancelled,
                "Worker finished task"
            );
        }

        self.reports_log().push(WorkerReport {
            id: Uuid::new_v4(),
            worker_id,
            worker_name,
            task_id: task.id,
            task_type: task.task_type,
            platform: task.platform,
            success,
            cancelled,
            fault,
            error,
            output: result.as_ref().ok().cloned(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
        });

        self.released.notify_one();
        result
    }

    /// Stop taking tasks. A running task keeps going.
    pub async fn pause(&self, worker_id: Uuid) -> Result<WorkerInfo> {
        let info = self
            .workers
            .update(
                &worker_id,
                Box::new(|w: &mut WorkerInfo| match w.state {
                    WorkerState::Idle | WorkerState::Running => w.transition_to(WorkerState::Paused),
                    state => Err(Error::conflict("worker", &w.name, state, "pause")),
                }),
            )
            .await?;
        tracing::info!(worker_id = %worker_id, "Worker paused");
        Ok(info)
    }

    /// Resume a paused worker, or clear an Error after remediation.
    pub async fn resume(&self, worker_id: Uuid) -> Result<WorkerInfo> {
        let info = self
            .workers
            .update(
                &worker_id,
                Box::new(|w: &mut WorkerInfo| match w.state {
                    WorkerState::Paused if w.current_task.is_some() => w.transition_to(WorkerState::Running),
                    WorkerState::Paused | WorkerState::Error => w.transition_to(WorkerState::Idle),
                    state => Err(Error::conflict("worker", &w.name, state, "resume")),
                }),
            )
            .await?;
        tracing::info!(worker_id = %worker_id, state = %info.state, "Worker resumed");
        self.released.notify_one();
        Ok(info)
    }

    /// Stop a worker for good. Graceful waits for the in-flight task; forced
    /// cancels it and returns immediately.
    pub async fn stop(&self, worker_id: Uuid, mode: StopMode) -> Result<WorkerInfo> {
        let info = self
            .workers
            .update(
                &worker_id,
                Box::new(|w: &mut WorkerInfo| {
                    if w.state != WorkerState::Stopped {
                        w.stopping = true;
                    }
                    Ok(())
                }),
            )
            .await?;
        if info.state == WorkerState::Stopped {
            return Ok(info);
        }

        let (busy, cancel) = {
            let controls = self.controls();
            match controls.get(&worker_id) {
                Some(c) => (Some(c.busy.subscribe()), c.cancel.clone()),
                None => (None, None),
            }
        };

        match mode {
            StopMode::Forced => {
                if let Some(token) = cancel {
                    tracing::warn!(worker_id = %worker_id, "Forced stop: cancelling in-flight task");
                    token.cancel();
                }
            }
            StopMode::Graceful => {
                if let Some(mut busy) = busy {
                    // Err means the control was dropped; nothing left to wait for.
                    let _ = busy.wait_for(|running| !*running).await;
                }
            }
        }

        let info = self
            .workers
            .update(
                &worker_id,
                Box::new(|w: &mut WorkerInfo| {
                    w.transition_to(WorkerState::Stopped)?;
                    w.stopping = false;
                    w.current_task = None;
                    Ok(())
                }),
            )
            .await?;
        tracing::info!(worker_id = %worker_id, ?mode, "Worker stopped");
        Ok(info)
    }

    async fn ids(&self) -> Vec<Uuid> {
        self.workers.snapshot().await.into_iter().map(|w| w.id).collect()
    }

    pub async fn pause_all(&self) -> BulkOutcome {
        let ids = self.ids().await;
        let results = join_all(ids.into_iter().map(|id| async move { (id, self.pause(id).await) })).await;
        BulkOutcome::collect(results)
    }

    pub async fn resume_all(&self) -> BulkOutcome {
        let ids = self.ids().await;
        let results = join_all(ids.into_iter().map(|id| async move { (id, self.resume(id).await) })).await;
        BulkOutcome::collect(results)
    }

    pub async fn stop_all(&self, mode: StopMode) -> BulkOutcome {
        let ids = self.ids().await;
        let results = join_all(ids.into_iter().map(|id| async move { (id, self.stop(id, mode).await) })).await;
        BulkOutcome::collect(results)
    }

    /// Newest reports first, optionally for one worker.
    pub fn reports(&self, limit: usize, worker_id: Option<Uuid>) -> Vec<WorkerReport> {
        self.reports_log().query(limit, worker_id)
    }

    pub async fn statistics(&self) -> PoolStatistics {
        let mut stats = PoolStatistics::default();
        for w in self.workers.snapshot().await {
            stats.total_workers += 1;
            match w.state {
                WorkerState::Idle => stats.idle += 1,
                WorkerState::Running => stats.running += 1,
                WorkerState::Paused => stats.paused += 1,
                WorkerState::Stopped => stats.stopped += 1,
                WorkerState::Error => stats.error += 1,
            }
            stats.tasks_processed += w.tasks_processed;
            stats.success_count += w.success_count;
            stats.failure_count += w.failure_count;
            *stats.by_platform.entry(w.platform).or_default() += 1;
        }
        stats.success_rate = match stats.tasks_processed {
            0 => 0.0,
            n => stats.success_count as f64 / n as f64,
        };
        stats
    }

    /// Stop every worker gracefully.
    pub async fn shutdown(&self) -> BulkOutcome {
        tracing::info!("Shutting down worker pool");
        self.stop_all(StopMode::Graceful).await
    }
}

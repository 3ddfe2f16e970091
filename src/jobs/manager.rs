//! Job manager: runs workflow versions as tracked, controllable jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use tokio::sync::{Semaphore, broadcast, mpsc, watch};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::automation::content::placeholders;
use crate::automation::{ContentProvider, ExecutionContent};
use crate::config::JobConfig;
use crate::error::{Error, Result};
use crate::executor::{
    ExecutionOptions, ExecutionResult, ExecutionSignals, ProgressEvent, WorkflowExecutor,
};
use crate::jobs::model::{
    ActiveJob, JobEvent, JobFilter, JobParams, JobProgress, JobStatistics, JobStatus, LogLevel,
};
use crate::store::{KeyedStore, MemoryStore};
use crate::workflows::{LeasedWorkflow, WorkflowStore};

/// Run-time controls for a job that has not finished yet.
struct JobControl {
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

pub struct JobManager {
    jobs: Arc<dyn KeyedStore<Uuid, ActiveJob>>,
    controls: Mutex<HashMap<Uuid, JobControl>>,
    workflows: Arc<WorkflowStore>,
    executor: Arc<WorkflowExecutor>,
    content_provider: Option<Arc<dyn ContentProvider>>,
    permits: Arc<Semaphore>,
    events: broadcast::Sender<JobEvent>,
    config: JobConfig,
}

impl JobManager {
    pub fn new(workflows: Arc<WorkflowStore>, executor: Arc<WorkflowExecutor>, config: JobConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            jobs: Arc::new(MemoryStore::new("job")),
            controls: Mutex::new(HashMap::new()),
            workflows,
            executor,
            content_provider: None,
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            events,
            config,
        }
    }

    /// Look up missing credentials through `provider` before a run.
    pub fn with_content_provider(mut self, provider: Arc<dyn ContentProvider>) -> Self {
        self.content_provider = Some(provider);
        self
    }

    fn controls(&self) -> MutexGuard<'_, HashMap<Uuid, JobControl>> {
        self.controls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Create a job for a workflow version and start running it in the background.
    pub async fn start_job(
        self: &Arc<Self>,
        workflow_id: &str,
        user_id: &str,
        params: JobParams,
    ) -> Result<ActiveJob> {
        if user_id.trim().is_empty() {
            return Err(Error::Validation("user id must not be empty".to_string()));
        }

        let job_id = Uuid::new_v4();
        let leased = self
            .workflows
            .acquire(workflow_id, params.version, job_id, params.prefer_confident)
            .await?;

        let job = ActiveJob {
            id: job_id,
            workflow_id: leased.workflow.workflow_id.clone(),
            workflow_version: leased.workflow.version,
            platform: leased.platform,
            user_id: user_id.to_string(),
            status: JobStatus::Pending,
            progress: JobProgress::new(leased.workflow.steps.len() as u32),
            dry_run: params.dry_run,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        };
        self.jobs.insert(job_id, job.clone()).await?;

        let cancel = CancellationToken::new();
        let (pause_tx, pause_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        self.controls().insert(
            job_id,
            JobControl {
                cancel: cancel.clone(),
                pause: pause_tx,
                done: done_rx,
            },
        );

        tracing::info!(
            job_id = %job_id,
            workflow_id = %job.workflow_id,
            version = job.workflow_version,
            dry_run = job.dry_run,
            "Job created"
        );
        self.publish(JobEvent::Created {
            job_id,
            workflow_id: job.workflow_id.clone(),
            version: job.workflow_version,
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager
                .run(job_id, leased, params.content, params.dry_run, cancel, pause_rx)
                .await;
            let _ = done_tx.send(true);
            manager.controls().remove(&job_id);
        });

        Ok(job)
    }

    async fn run(
        &self,
        job_id: Uuid,
        leased: LeasedWorkflow,
        content: ExecutionContent,
        dry_run: bool,
        cancel: CancellationToken,
        pause: watch::Receiver<bool>,
    ) {
        let LeasedWorkflow {
            lease,
            platform,
            workflow,
        } = leased;

        let _permit = tokio::select! {
            _ = cancel.cancelled() => {
                self.finish_cancelled_pending(job_id).await;
                return;
            }
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.finalize(job_id, JobStatus::Failed, None, Some("job manager is shut down".to_string())).await;
                    return;
                }
            },
        };

        if let Err(e) = self.set_status(job_id, JobStatus::Running).await {
            tracing::debug!(job_id = %job_id, error = %e, "Job did not start");
            return;
        }

        let content = self.with_credentials(content, &workflow, platform, job_id).await;

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let signals = ExecutionSignals {
            cancel: cancel.clone(),
            pause: Some(pause),
            progress: Some(progress_tx),
        };

        let execution = async {
            let exec = self.executor.execute(
                platform,
                &workflow,
                &content,
                ExecutionOptions { dry_run },
                signals,
            );
            tokio::pin!(exec);
            match self.config.job_timeout {
                Some(limit) => tokio::select! {
                    result = &mut exec => (result, false),
                    _ = tokio::time::sleep(limit) => {
                        tracing::warn!(job_id = %job_id, limit_secs = limit.as_secs(), "Job exceeded its time limit");
                        cancel.cancel();
                        (exec.await, true)
                    }
                },
                None => (exec.await, false),
            }
        };
        let track = async {
            while let Some(event) = progress_rx.recv().await {
                self.apply_progress(job_id, event).await;
            }
        };
        let ((result, timed_out), ()) = tokio::join!(execution, track);

        // Only complete, uninterrupted runs say anything about the workflow.
        if !dry_run && !timed_out && !result.cancelled {
            let outcomes = result.selector_outcomes();
            if let Err(e) = self
                .workflows
                .record_execution(&result.workflow_id, result.version, result.success, &outcomes)
                .await
            {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to record workflow statistics");
            }
        }

        let (status, error) = if timed_out {
            let limit = self.config.job_timeout.unwrap_or_default();
            (JobStatus::Failed, Some(format!("job exceeded its time limit of {limit:?}")))
        } else if result.cancelled {
            (JobStatus::Cancelled, None)
        } else if result.success {
            (JobStatus::Completed, None)
        } else {
            (JobStatus::Failed, result.error.clone())
        };

        self.finalize(job_id, status, Some(result), error).await;
        drop(lease);
    }

    async fn with_credentials(
        &self,
        content: ExecutionContent,
        workflow: &crate::workflows::LearnedWorkflow,
        platform: crate::platform::Platform,
        job_id: Uuid,
    ) -> ExecutionContent {
        let Some(provider) = &self.content_provider else {
            return content;
        };
        if content.credentials.is_some() {
            return content;
        }
        let needs_login = workflow
            .steps
            .iter()
            .filter_map(|s| s.input.as_deref())
            .flat_map(placeholders)
            .any(|p| matches!(p.as_str(), "username" | "email" | "password"));
        if !needs_login {
            return content;
        }

        let user_id = match self.jobs.get(&job_id).await {
            Some(job) => job.user_id,
            None => return content,
        };
        match provider.credentials(&user_id, platform).await {
            Ok(Some(credentials)) => content.with_credentials(credentials),
            Ok(None) => {
                tracing::warn!(job_id = %job_id, %platform, "No stored credentials for login steps");
                content
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Credential lookup failed");
                content
            }
        }
    }

    async fn apply_progress(&self, job_id: Uuid, event: ProgressEvent) {
        let cap = self.config.max_log_entries;
        let updated = self
            .jobs
            .update(
                &job_id,
                Box::new(move |job: &mut ActiveJob| {
                    match event {
                        ProgressEvent::StepStarted { step, description, .. } => {
                            job.progress.log(LogLevel::Info, format!("step {step} started: {description}"), cap);
                        }
                        ProgressEvent::StepFinished { result, index, .. } => {
                            job.progress.advance(index + 1);
                            let (level, message) = match (&result.error, result.skipped) {
                                (Some(e), _) => (LogLevel::Error, format!("step {} failed: {e}", result.step)),
                                (None, true) => (LogLevel::Warn, format!("step {} skipped (dry run)", result.step)),
                                (None, false) => (LogLevel::Info, format!("step {} done", result.step)),
                            };
                            job.progress.log(level, message, cap);
                        }
                        ProgressEvent::Paused { before_step } => {
                            job.progress.log(LogLevel::Info, format!("paused before step {before_step}"), cap);
                        }
                        ProgressEvent::Resumed { step } => {
                            job.progress.log(LogLevel::Info, format!("resumed at step {step}"), cap);
                        }
                    }
                    Ok(())
                }),
            )
            .await;

        if let Ok(job) = updated {
            self.publish(JobEvent::Progress {
                job_id,
                current_step: job.progress.current_step,
                total_steps: job.progress.total_steps,
                percentage: job.progress.percentage,
            });
        }
    }

    async fn set_status(&self, job_id: Uuid, status: JobStatus) -> Result<ActiveJob> {
        let mut from = None;
        let job = self
            .jobs
            .update(
                &job_id,
                Box::new(|job: &mut ActiveJob| {
                    from = Some(job.status);
                    job.transition_to(status)
                }),
            )
            .await?;
        if let Some(from) = from {
            self.publish(JobEvent::StatusChanged { job_id, from, to: status });
        }
        Ok(job)
    }

    async fn finish_cancelled_pending(&self, job_id: Uuid) {
        if let Some(job) = self.jobs.get(&job_id).await
            && job.status.is_active()
        {
            self.finalize(job_id, JobStatus::Cancelled, None, None).await;
        }
    }

    async fn finalize(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result: Option<ExecutionResult>,
        error: Option<String>,
    ) {
        let cap = self.config.max_log_entries;
        let mut from = None;
        let updated = self
            .jobs
            .update(
                &job_id,
                Box::new(|job: &mut ActiveJob| {
                    from = Some(job.status);
                    if job.status.is_terminal() {
                        return Ok(());
                    }
                    job.transition_to(status)?;
                    let message = match &error {
                        Some(e) => format!("job {status}: {e}"),
                        None => format!("job {status}"),
                    };
                    let level = if status == JobStatus::Completed { LogLevel::Info } else { LogLevel::Warn };
                    job.progress.log(level, message, cap);
                    job.result = result;
                    job.error = error;
                    Ok(())
                }),
            )
            .await;

        match updated {
            Ok(job) => {
                if let Some(from) = from
                    && !from.is_terminal()
                {
                    self.publish(JobEvent::StatusChanged { job_id, from, to: job.status });
                }
                tracing::info!(
                    job_id = %job_id,
                    workflow_id = %job.workflow_id,
                    status = %job.status,
                    steps = job.progress.current_step,
                    "Job finished"
                );
            }
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to finalize job"),
        }
    }

    /// Hold a running job at its next step boundary.
    pub async fn pause_job(&self, job_id: Uuid) -> Result<ActiveJob> {
        let job = self.get_job(job_id).await?;
        if job.status != JobStatus::Running {
            return Err(Error::conflict("job", job_id, job.status, "pause"));
        }
        let job = self.set_status(job_id, JobStatus::Paused).await?;
        if let Some(control) = self.controls().get(&job_id) {
            control.pause.send_replace(true);
        }
        tracing::info!(job_id = %job_id, step = job.progress.current_step, "Job paused");
        Ok(job)
    }

    pub async fn resume_job(&self, job_id: Uuid) -> Result<ActiveJob> {
        let job = self.get_job(job_id).await?;
        if job.status != JobStatus::Paused {
            return Err(Error::conflict("job", job_id, job.status, "resume"));
        }
        let job = self.set_status(job_id, JobStatus::Running).await?;
        if let Some(control) = self.controls().get(&job_id) {
            control.pause.send_replace(false);
        }
        tracing::info!(job_id = %job_id, step = job.progress.current_step, "Job resumed");
        Ok(job)
    }

    /// Request cancellation. `Ok(false)` when the job already finished or a
    /// cancel is already under way.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        let job = self.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(false);
        }

        let token = {
            let controls = self.controls();
            match controls.get(&job_id) {
                Some(control) if !control.cancel.is_cancelled() => control.cancel.clone(),
                _ => return Ok(false),
            }
        };
        token.cancel();

        if job.status == JobStatus::Pending {
            self.finalize(job_id, JobStatus::Cancelled, None, None).await;
        }
        tracing::info!(job_id = %job_id, status = %job.status, "Job cancellation requested");
        Ok(true)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<ActiveJob> {
        self.jobs
            .get(&job_id)
            .await
            .ok_or_else(|| Error::not_found("job", job_id))
    }

    /// Jobs matching `filter`, oldest first.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Vec<ActiveJob> {
        let mut jobs: Vec<ActiveJob> = self
            .jobs
            .snapshot()
            .await
            .into_iter()
            .filter(|j| filter.matches(j))
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Wait until the job reaches a terminal status.
    pub async fn wait_for_job(&self, job_id: Uuid) -> Result<ActiveJob> {
        let done = self.controls().get(&job_id).map(|c| c.done.clone());
        if let Some(mut done) = done {
            // A closed channel means the run task is gone; the job is final either way.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.get_job(job_id).await
    }

    /// Drop terminal jobs that finished more than `max_age` ago.
    pub async fn cleanup_completed_jobs(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let removed = self
            .jobs
            .remove_where(&move |job: &ActiveJob| {
                job.status.is_terminal()
                    && job
                        .completed_at
                        .is_some_and(|at| (now - at).to_std().unwrap_or_default() >= max_age)
            })
            .await;
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), "Cleaned up finished jobs");
        }
        removed.len()
    }

    pub async fn statistics(&self) -> JobStatistics {
        let mut stats = JobStatistics::default();
        for job in self.jobs.snapshot().await {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Paused => stats.paused += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
            let per = stats.by_workflow.entry(job.workflow_id).or_default();
            per.total += 1;
            match job.status {
                JobStatus::Completed => per.completed += 1,
                JobStatus::Failed => per.failed += 1,
                _ => {}
            }
            stats.total += 1;
        }
        stats
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Job events as a stream; events missed by a slow consumer are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = JobEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| event.ok())
    }

    /// Cancel every unfinished job.
    pub fn cancel_all(&self) {
        for control in self.controls().values() {
            control.cancel.cancel();
        }
    }
}

/// Periodically drop old finished jobs until `shutdown` fires.
pub fn spawn_job_cleanup(
    manager: Arc<JobManager>,
    interval: Duration,
    max_age: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    manager.cleanup_completed_jobs(max_age).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{AutomationLauncher, Credentials};
    use crate::config::{ExecutorConfig, WorkflowStoreConfig};
    use crate::error::AutomationError;
    use crate::platform::Platform;
    use crate::testing::{FakeBrowser, FakeLauncher};
    use crate::workflows::{ElementSelector, NewWorkflow, SelectorKind, StepAction, WorkflowStep};
    use async_trait::async_trait;

    struct Harness {
        manager: Arc<JobManager>,
        store: Arc<WorkflowStore>,
        browser: FakeBrowser,
    }

    fn harness(config: JobConfig) -> Harness {
        let browser = FakeBrowser::new().with_elements(["id:composer", "id:post"]);
        let launcher: Arc<dyn AutomationLauncher> = Arc::new(FakeLauncher::new(browser.clone()));
        let executor = Arc::new(WorkflowExecutor::new(
            launcher,
            &ExecutorConfig {
                element_timeout: Duration::from_millis(100),
            },
        ));
        let store = Arc::new(WorkflowStore::new(WorkflowStoreConfig::default()));
        Harness {
            manager: Arc::new(JobManager::new(Arc::clone(&store), executor, config)),
            store,
            browser,
        }
    }

    fn steps(wait_ms: u64) -> Vec<WorkflowStep> {
        vec![
            WorkflowStep::new(1, StepAction::Click, "open")
                .with_selector(ElementSelector::new(SelectorKind::Id, "composer"))
                .with_wait(Duration::from_millis(wait_ms)),
            WorkflowStep::new(2, StepAction::Type, "write")
                .with_selector(ElementSelector::new(SelectorKind::Id, "composer"))
                .with_input("{{content}}")
                .with_wait(Duration::from_millis(wait_ms)),
            WorkflowStep::new(3, StepAction::Click, "post")
                .with_selector(ElementSelector::new(SelectorKind::Id, "post"))
                .irreversible(),
        ]
    }

    async fn save(store: &WorkflowStore, wait_ms: u64) -> String {
        store
            .save(NewWorkflow::for_task(Platform::Facebook, "post_content", steps(wait_ms)))
            .await
            .unwrap()
            .workflow_id
    }

    fn params() -> JobParams {
        JobParams {
            content: ExecutionContent::default().with_text("hi"),
            ..JobParams::default()
        }
    }

    async fn wait_until<F>(manager: &JobManager, job_id: Uuid, pred: F) -> ActiveJob
    where
        F: Fn(&ActiveJob) -> bool,
    {
        for _ in 0..200 {
            let job = manager.get_job(job_id).await.unwrap();
            if pred(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached the expected state");
    }

    #[tokio::test]
    async fn job_runs_to_completion_and_updates_workflow() {
        let h = harness(JobConfig::default());
        let id = save(&h.store, 0).await;

        let job = h.manager.start_job(&id, "u1", params()).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let done = h.manager.wait_for_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress.current_step, 3);
        assert_eq!(done.progress.percentage, 100);
        assert!(done.result.unwrap().success);

        let wf = h.store.get_version(&id, 1).await.unwrap();
        assert_eq!(wf.success_count, 1);
        assert_eq!(h.store.active_references(&id), 0);
        assert!(h.browser.journal().contains(&"type:id:composer=hi".to_string()));
    }

    #[tokio::test]
    async fn missing_or_inactive_workflow_is_rejected() {
        let h = harness(JobConfig::default());
        let err = h.manager.start_job("facebook.nothing", "u1", params()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        let id = save(&h.store, 0).await;
        h.store.set_active(&id, false).await.unwrap();
        let err = h.manager.start_job(&id, "u1", params()).await.unwrap_err();
        assert!(matches!(err, Error::StateConflict { .. }));
    }

    #[tokio::test]
    async fn failed_run_marks_job_failed_and_counts_failure() {
        let h = harness(JobConfig::default());
        let id = save(&h.store, 0).await;
        h.browser.remove_element("id:post");

        let job = h.manager.start_job(&id, "u1", params()).await.unwrap();
        let done = h.manager.wait_for_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.result.as_ref().unwrap().failed_at_step, Some(3));
        assert!(done.error.unwrap().contains("step 3"));
        assert_eq!(h.store.get_version(&id, 1).await.unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn dry_run_leaves_statistics_alone() {
        let h = harness(JobConfig::default());
        let id = save(&h.store, 0).await;
        let job = h
            .manager
            .start_job(&id, "u1", JobParams { dry_run: true, ..params() })
            .await
            .unwrap();
        let done = h.manager.wait_for_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(!h.browser.journal().contains(&"click:id:post".to_string()));
        assert_eq!(h.store.get_version(&id, 1).await.unwrap().total_runs(), 0);
    }

    #[tokio::test]
    async fn pause_then_resume_keeps_position() {
        let h = harness(JobConfig::default());
        let id = save(&h.store, 80).await;
        let job = h.manager.start_job(&id, "u1", params()).await.unwrap();

        wait_until(&h.manager, job.id, |j| j.progress.current_step >= 1).await;
        let paused = h.manager.pause_job(job.id).await.unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        let at = paused.progress.current_step;

        tokio::time::sleep(Duration::from_millis(300)).await;
        let still = h.manager.get_job(job.id).await.unwrap();
        assert_eq!(still.status, JobStatus::Paused);
        assert_eq!(still.progress.current_step, at);

        assert!(h.manager.pause_job(job.id).await.is_err());
        h.manager.resume_job(job.id).await.unwrap();
        let done = h.manager.wait_for_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress.current_step, 3);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_releases_the_lease() {
        let h = harness(JobConfig::default());
        let id = save(&h.store, 5_000).await;
        let job = h.manager.start_job(&id, "u1", params()).await.unwrap();
        wait_until(&h.manager, job.id, |j| j.status == JobStatus::Running).await;

        let err = h.store.delete(&id).await.unwrap_err();
        assert!(matches!(err, Error::StateConflict { .. }));

        assert!(h.manager.cancel_job(job.id).await.unwrap());
        assert!(!h.manager.cancel_job(job.id).await.unwrap());
        let done = h.manager.wait_for_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);
        assert!(!h.manager.cancel_job(job.id).await.unwrap());

        assert_eq!(h.store.get_version(&id, 1).await.unwrap().total_runs(), 0);
        h.store.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn pending_jobs_wait_for_a_slot_and_cancel_immediately() {
        let h = harness(JobConfig {
            max_concurrent_jobs: 1,
            ..JobConfig::default()
        });
        let id = save(&h.store, 5_000).await;
        let first = h.manager.start_job(&id, "u1", params()).await.unwrap();
        wait_until(&h.manager, first.id, |j| j.status == JobStatus::Running).await;

        let second = h.manager.start_job(&id, "u1", params()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.manager.get_job(second.id).await.unwrap().status, JobStatus::Pending);

        assert!(h.manager.cancel_job(second.id).await.unwrap());
        assert_eq!(h.manager.get_job(second.id).await.unwrap().status, JobStatus::Cancelled);

        h.manager.cancel_job(first.id).await.unwrap();
        h.manager.wait_for_job(first.id).await.unwrap();
        h.manager.wait_for_job(second.id).await.unwrap();
        assert_eq!(h.store.active_references(&id), 0);
    }

    #[tokio::test]
    async fn wall_clock_limit_fails_the_job() {
        let h = harness(JobConfig {
            job_timeout: Some(Duration::from_millis(50)),
            ..JobConfig::default()
        });
        let id = save(&h.store, 5_000).await;
        let job = h.manager.start_job(&id, "u1", params()).await.unwrap();
        let done = h.manager.wait_for_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("time limit"));
    }

    #[tokio::test]
    async fn timed_out_run_is_not_recorded() {
        let h = harness(JobConfig {
            job_timeout: Some(Duration::from_millis(50)),
            ..JobConfig::default()
        });
        let id = save(&h.store, 5_000).await;
        let confidence = h.store.get_version(&id, 1).await.unwrap().confidence;
        let job = h.manager.start_job(&id, "u1", params()).await.unwrap();
        let done = h.manager.wait_for_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.result.unwrap().cancelled);

        let wf = h.store.get_version(&id, 1).await.unwrap();
        assert_eq!(wf.total_runs(), 0);
        assert_eq!(wf.confidence, confidence);
        assert_eq!(h.store.active_references(&id), 0);
    }

    #[tokio::test]
    async fn cancel_during_element_lookup_cancels_the_job() {
        let browser = FakeBrowser::new()
            .with_elements(["id:composer", "id:post"])
            .with_lookup_delay(Duration::from_millis(300));
        let launcher: Arc<dyn AutomationLauncher> = Arc::new(FakeLauncher::new(browser.clone()));
        let executor = Arc::new(WorkflowExecutor::new(
            launcher,
            &ExecutorConfig {
                element_timeout: Duration::from_secs(2),
            },
        ));
        let store = Arc::new(WorkflowStore::new(WorkflowStoreConfig::default()));
        let manager = Arc::new(JobManager::new(Arc::clone(&store), executor, JobConfig::default()));
        let id = save(&store, 0).await;
        let confidence = store.get_version(&id, 1).await.unwrap().confidence;

        let job = manager.start_job(&id, "u1", params()).await.unwrap();
        wait_until(&manager, job.id, |j| j.status == JobStatus::Running).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(manager.cancel_job(job.id).await.unwrap());

        let done = manager.wait_for_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);
        let result = done.result.unwrap();
        assert!(result.cancelled);
        assert_eq!(result.failed_at_step, None);
        assert!(result.step_results.is_empty());

        let wf = store.get_version(&id, 1).await.unwrap();
        assert_eq!(wf.total_runs(), 0);
        assert_eq!(wf.confidence, confidence);
        assert!(browser.journal().is_empty());
    }

    #[tokio::test]
    async fn lease_is_held_until_the_job_is_final() {
        let h = harness(JobConfig::default());
        let id = save(&h.store, 0).await;
        let job = h.manager.start_job(&id, "u1", params()).await.unwrap();
        assert_eq!(h.store.active_references(&id), 1);

        loop {
            if h.store.active_references(&id) == 0 {
                let job = h.manager.get_job(job.id).await.unwrap();
                assert!(job.status.is_terminal(), "lease released while {}", job.status);
                break;
            }
            tokio::task::yield_now().await;
        }
        h.store.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_and_statistics() {
        let h = harness(JobConfig::default());
        let id = save(&h.store, 0).await;
        for _ in 0..2 {
            let job = h.manager.start_job(&id, "u1", params()).await.unwrap();
            h.manager.wait_for_job(job.id).await.unwrap();
        }

        let stats = h.manager.statistics().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.by_workflow[&id].completed, 2);

        let filtered = h
            .manager
            .list_jobs(&JobFilter {
                status: Some(JobStatus::Completed),
                ..JobFilter::default()
            })
            .await;
        assert_eq!(filtered.len(), 2);

        assert_eq!(h.manager.cleanup_completed_jobs(Duration::from_secs(3600)).await, 0);
        assert_eq!(h.manager.cleanup_completed_jobs(Duration::ZERO).await, 2);
        assert_eq!(h.manager.statistics().await.total, 0);
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let h = harness(JobConfig::default());
        let id = save(&h.store, 0).await;
        let mut events = h.manager.subscribe();
        let job = h.manager.start_job(&id, "u1", params()).await.unwrap();
        h.manager.wait_for_job(job.id).await.unwrap();

        let mut saw_created = false;
        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                JobEvent::Created { job_id, .. } if job_id == job.id => saw_created = true,
                JobEvent::StatusChanged { to: JobStatus::Completed, .. } => saw_completed = true,
                _ => {}
            }
        }
        assert!(saw_created && saw_completed);
    }

    struct StaticCredentials;

    #[async_trait]
    impl ContentProvider for StaticCredentials {
        async fn credentials(
            &self,
            _user_id: &str,
            _platform: Platform,
        ) -> std::result::Result<Option<Credentials>, AutomationError> {
            Ok(Some(Credentials::new("alice", "s3cret")))
        }
    }

    #[tokio::test]
    async fn login_steps_pull_credentials_from_provider() {
        let browser = FakeBrowser::new().with_elements(["id:user", "id:pass"]);
        let launcher: Arc<dyn AutomationLauncher> = Arc::new(FakeLauncher::new(browser.clone()));
        let executor = Arc::new(WorkflowExecutor::new(launcher, &ExecutorConfig::default()));
        let store = Arc::new(WorkflowStore::new(WorkflowStoreConfig::default()));
        let manager = Arc::new(
            JobManager::new(Arc::clone(&store), executor, JobConfig::default())
                .with_content_provider(Arc::new(StaticCredentials)),
        );
        let wf = store
            .save(NewWorkflow::for_task(
                Platform::Instagram,
                "login",
                vec![
                    WorkflowStep::new(1, StepAction::Type, "user")
                        .with_selector(ElementSelector::new(SelectorKind::Id, "user"))
                        .with_input("{{username}}"),
                    WorkflowStep::new(2, StepAction::Type, "pass")
                        .with_selector(ElementSelector::new(SelectorKind::Id, "pass"))
                        .with_input("{{password}}"),
                ],
            ))
            .await
            .unwrap();

        let job = manager.start_job(&wf.workflow_id, "u1", JobParams::default()).await.unwrap();
        let done = manager.wait_for_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(browser.journal().contains(&"type:id:pass=s3cret".to_string()));
    }
}

//! Runs browser-automation tasks as workflow jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::automation::ExecutionContent;
use crate::error::{Error, Result};
use crate::executor::ExecutionResult;
use crate::jobs::{ActiveJob, JobManager, JobParams, JobStatus};
use crate::knowledge::KnowledgeBase;
use crate::platform::Platform;
use crate::tasks::handler::{TaskContext, TaskHandler};
use crate::tasks::model::{Task, TaskPayload, TaskType};
use crate::workflows::WorkflowDefinition;

const PROGRESS_POLL: Duration = Duration::from_millis(100);

/// Handles one automation task type by replaying the learned workflow for
/// `{platform}.{task_type}` (or the workflow named in the payload).
pub struct WorkflowTaskHandler {
    task_type: TaskType,
    jobs: Arc<JobManager>,
    knowledge: Arc<KnowledgeBase>,
    /// Knowledge entry offered after the last failure, scored by the next run.
    suggested: Mutex<HashMap<Platform, Uuid>>,
}

impl WorkflowTaskHandler {
    pub fn new(task_type: TaskType, jobs: Arc<JobManager>, knowledge: Arc<KnowledgeBase>) -> Self {
        Self {
            task_type,
            jobs,
            knowledge,
            suggested: Mutex::new(HashMap::new()),
        }
    }

    fn suggested(&self) -> MutexGuard<'_, HashMap<Platform, Uuid>> {
        self.suggested.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Credit or debit the fix suggested after the previous failure.
    async fn score_suggestion(&self, platform: Platform, success: bool) {
        let Some(entry_id) = self.suggested().remove(&platform) else {
            return;
        };
        if let Err(e) = self.knowledge.record_outcome(entry_id, success).await {
            tracing::debug!(entry_id = %entry_id, error = %e, "Suggested fix no longer exists");
        }
    }

    /// One handler per automation task type.
    pub fn for_all_automation_types(jobs: &Arc<JobManager>, knowledge: &Arc<KnowledgeBase>) -> Vec<Arc<dyn TaskHandler>> {
        TaskType::ALL
            .into_iter()
            .filter(TaskType::is_automation)
            .map(|t| Arc::new(Self::new(t, Arc::clone(jobs), Arc::clone(knowledge))) as Arc<dyn TaskHandler>)
            .collect()
    }

    /// Wait for the job, mirroring its progress and forwarding cancellation.
    async fn follow(&self, job_id: Uuid, ctx: &TaskContext) -> Result<ActiveJob> {
        let done = self.jobs.wait_for_job(job_id);
        tokio::pin!(done);
        let mut ticker = tokio::time::interval(PROGRESS_POLL);
        let mut cancel_sent = false;

        loop {
            tokio::select! {
                job = &mut done => return job,
                _ = ctx.cancel.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    self.jobs.cancel_job(job_id).await?;
                }
                _ = ticker.tick() => {
                    if let Ok(job) = self.jobs.get_job(job_id).await {
                        ctx.set_progress(job.progress.percentage);
                    }
                }
            }
        }
    }

    async fn failed(&self, task: &Task, workflow_id: String, job_id: Option<Uuid>, reason: String) -> Error {
        let key = self.task_type.as_str();
        self.score_suggestion(task.platform, false).await;
        let failures = self.knowledge.record_failure(task.platform, key).await;
        let solution = self.knowledge.find_solution(task.platform, &reason).await;
        if let Some(found) = &solution {
            self.suggested().insert(task.platform, found.entry.id);
        }
        let escalate = self.knowledge.should_escalate_to_human(task.platform, key).await;
        tracing::warn!(
            task_id = %task.id,
            workflow_id = %workflow_id,
            failures,
            escalate,
            known_solution = solution.is_some(),
            "Automation task failed"
        );
        Error::WorkflowFailed {
            workflow_id,
            job_id,
            reason,
            solution: solution.map(|m| m.entry.solution),
            escalate,
        }
    }
}

/// Map a payload onto the values its workflow's placeholders draw from.
pub fn content_for(payload: &TaskPayload) -> ExecutionContent {
    match payload {
        TaskPayload::GenerateContent { prompt, topics } => ExecutionContent::default()
            .with_text(prompt.clone())
            .with_variable("topics", topics.join(", ")),
        TaskPayload::PostContent {
            text, hashtags, media, ..
        } => {
            let mut content = ExecutionContent::default()
                .with_hashtags(hashtags.iter().cloned())
                .with_media(media.iter().cloned());
            if !text.trim().is_empty() {
                content = content.with_text(text.clone());
            }
            content
        }
        TaskPayload::DiscoverGroups { keywords, limit, .. } => {
            let mut content = ExecutionContent::default()
                .with_text(keywords.join(" "))
                .with_variable("keywords", keywords.join(" "));
            if let Some(limit) = limit {
                content = content.with_variable("limit", limit.to_string());
            }
            content
        }
        TaskPayload::JoinGroups { group_urls, .. } => {
            let mut content = ExecutionContent::default().with_variable("group_urls", group_urls.join(","));
            if let Some(first) = group_urls.first() {
                content = content.with_variable("group_url", first.clone());
            }
            content
        }
        TaskPayload::ReplyComments {
            post_url, reply_text, ..
        } => ExecutionContent::default()
            .with_text(reply_text.clone())
            .with_variable("post_url", post_url.clone())
            .with_variable("reply_text", reply_text.clone()),
    }
}

/// The run never got as far as its first step.
fn never_started(result: &ExecutionResult) -> bool {
    !result.success && !result.cancelled && result.total_steps > 0 && result.step_results.is_empty()
}

#[async_trait]
impl TaskHandler for WorkflowTaskHandler {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<serde_json::Value> {
        let options = task
            .payload
            .automation_options()
            .ok_or_else(|| Error::Validation(format!("{} is not a browser workflow task", task.task_type)))?;
        let workflow_id = options
            .workflow_id
            .clone()
            .unwrap_or_else(|| WorkflowDefinition::id_for(task.platform, task.task_type.as_str()));

        let params = JobParams {
            version: options.workflow_version,
            content: content_for(&task.payload),
            dry_run: options.dry_run,
            prefer_confident: false,
        };
        let job = match self.jobs.start_job(&workflow_id, &task.user_id, params).await {
            Ok(job) => job,
            Err(e) => return Err(self.failed(task, workflow_id, None, e.to_string()).await),
        };
        tracing::debug!(task_id = %task.id, job_id = %job.id, workflow_id = %workflow_id, "Task running as job");

        let job = self.follow(job.id, ctx).await?;
        match job.status {
            JobStatus::Completed => {
                self.knowledge.record_success(task.platform, self.task_type.as_str()).await;
                if !job.dry_run {
                    self.score_suggestion(task.platform, true).await;
                }
                let (steps_completed, duration_ms) = job
                    .result
                    .as_ref()
                    .map_or((0, 0), |r| (r.steps_completed(), r.duration_ms()));
                Ok(serde_json::json!({
                    "job_id": job.id,
                    "workflow_id": job.workflow_id,
                    "version": job.workflow_version,
                    "steps_completed": steps_completed,
                    "total_steps": job.progress.total_steps,
                    "dry_run": job.dry_run,
                    "duration_ms": duration_ms,
                }))
            }
            JobStatus::Cancelled => Err(Error::WorkflowFailed {
                workflow_id: job.workflow_id,
                job_id: Some(job.id),
                reason: "job cancelled".to_string(),
                solution: None,
                escalate: false,
            }),
            _ => {
                let reason = job
                    .error
                    .clone()
                    .or_else(|| job.result.as_ref().and_then(|r| r.error.clone()))
                    .unwrap_or_else(|| format!("job ended {}", job.status));
                if job.result.as_ref().is_some_and(never_started) {
                    // The automation backend itself is broken: take the worker out.
                    self.knowledge.record_failure(task.platform, self.task_type.as_str()).await;
                    return Err(Error::ExecutionFault(reason));
                }
                Err(self.failed(task, job.workflow_id, Some(job.id), reason).await)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::automation::AutomationLauncher;
    use crate::config::{ExecutorConfig, JobConfig, KnowledgeConfig, WorkflowStoreConfig};
    use crate::executor::WorkflowExecutor;
    use crate::platform::Platform;
    use crate::tasks::model::{AutomationOptions, TaskPriority, TaskStatus};
    use crate::testing::{FakeBrowser, FakeLauncher};
    use crate::workflows::{ElementSelector, NewWorkflow, SelectorKind, StepAction, WorkflowStep, WorkflowStore};

    struct Harness {
        handler: WorkflowTaskHandler,
        knowledge: Arc<KnowledgeBase>,
        browser: FakeBrowser,
        launcher: Arc<FakeLauncher>,
        store: Arc<WorkflowStore>,
    }

    fn browser() -> FakeBrowser {
        FakeBrowser::new().with_elements(["id:composer", "id:post"])
    }

    async fn harness() -> Harness {
        harness_with(browser()).await
    }

    async fn harness_with(browser: FakeBrowser) -> Harness {
        let launcher = Arc::new(FakeLauncher::new(browser.clone()));
        let dyn_launcher: Arc<dyn AutomationLauncher> = launcher.clone();
        let store = Arc::new(WorkflowStore::new(WorkflowStoreConfig::default()));
        let executor = Arc::new(WorkflowExecutor::new(
            dyn_launcher,
            &ExecutorConfig {
                element_timeout: Duration::from_millis(100),
            },
        ));
        let jobs = Arc::new(JobManager::new(Arc::clone(&store), executor, JobConfig::default()));
        let knowledge = Arc::new(KnowledgeBase::new(KnowledgeConfig {
            escalation_threshold: 2,
        }));

        store
            .save(NewWorkflow::for_task(
                Platform::Facebook,
                "post_content",
                vec![
                    WorkflowStep::new(1, StepAction::Click, "open composer")
                        .with_selector(ElementSelector::new(SelectorKind::Id, "composer")),
                    WorkflowStep::new(2, StepAction::Type, "write post")
                        .with_selector(ElementSelector::new(SelectorKind::Id, "composer"))
                        .with_input("{{content}} {{hashtags}}"),
                    WorkflowStep::new(3, StepAction::Click, "publish")
                        .with_selector(ElementSelector::new(SelectorKind::Id, "post"))
                        .irreversible(),
                ],
            ))
            .await
            .unwrap();

        Harness {
            handler: WorkflowTaskHandler::new(TaskType::PostContent, jobs, Arc::clone(&knowledge)),
            knowledge,
            browser,
            launcher,
            store,
        }
    }

    fn post_task(text: &str, options: AutomationOptions) -> Task {
        Task {
            id: Uuid::new_v4(),
            task_type: TaskType::PostContent,
            platform: Platform::Facebook,
            user_id: "u1".into(),
            brand_id: None,
            payload: TaskPayload::PostContent {
                text: text.into(),
                hashtags: vec!["rust".into()],
                media: vec![],
                options,
            },
            priority: TaskPriority::Normal,
            status: TaskStatus::Running,
            progress: 0,
            worker_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    fn ctx(task: &Task) -> TaskContext {
        TaskContext::new(task.id, Uuid::new_v4(), Default::default(), Default::default())
    }

    #[tokio::test]
    async fn replays_the_platform_workflow() {
        let h = harness().await;
        let task = post_task("hello", AutomationOptions::default());
        let output = h.handler.handle(&task, &ctx(&task)).await.unwrap();

        assert_eq!(output["workflow_id"], "facebook.post_content");
        assert_eq!(output["steps_completed"], 3);
        assert!(h.browser.journal().contains(&"type:id:composer=hello #rust".to_string()));
        assert!(h.browser.journal().contains(&"click:id:post".to_string()));
    }

    #[tokio::test]
    async fn dry_run_skips_publishing() {
        let h = harness().await;
        let task = post_task(
            "hello",
            AutomationOptions {
                dry_run: true,
                ..AutomationOptions::default()
            },
        );
        let output = h.handler.handle(&task, &ctx(&task)).await.unwrap();
        assert_eq!(output["dry_run"], true);
        assert!(!h.browser.journal().contains(&"click:id:post".to_string()));
    }

    #[tokio::test]
    async fn failures_attach_solution_and_escalate() {
        let h = harness().await;
        h.knowledge
            .add_entry(Platform::Facebook, r"step 3", "the publish button moved; re-teach the last step")
            .await
            .unwrap();
        h.browser.remove_element("id:post");
        let task = post_task("hello", AutomationOptions::default());

        let first = h.handler.handle(&task, &ctx(&task)).await.unwrap_err();
        match &first {
            Error::WorkflowFailed {
                solution, escalate, ..
            } => {
                assert!(solution.as_deref().unwrap().contains("re-teach"));
                assert!(!escalate);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!first.is_fault());

        let second = h.handler.handle(&task, &ctx(&task)).await.unwrap_err();
        assert!(matches!(second, Error::WorkflowFailed { escalate: true, .. }));

        // Success resets the streak.
        h.browser.add_element("id:post");
        h.handler.handle(&task, &ctx(&task)).await.unwrap();
        assert_eq!(h.knowledge.failure_count(Platform::Facebook, "post_content").await, 0);
    }

    #[tokio::test]
    async fn suggested_fix_is_scored_by_the_next_run() {
        let h = harness().await;
        let entry = h
            .knowledge
            .add_entry(Platform::Facebook, r"step 3", "re-teach the publish step")
            .await
            .unwrap();
        h.browser.remove_element("id:post");
        let task = post_task("hello", AutomationOptions::default());

        // The first failure only suggests the fix.
        h.handler.handle(&task, &ctx(&task)).await.unwrap_err();
        let untried = h.knowledge.get_entry(entry.id).await.unwrap();
        assert_eq!((untried.success_count, untried.failure_count), (0, 0));

        // Failing again counts against it and suggests it once more.
        h.handler.handle(&task, &ctx(&task)).await.unwrap_err();
        let missed = h.knowledge.get_entry(entry.id).await.unwrap();
        assert_eq!((missed.success_count, missed.failure_count), (0, 1));

        h.browser.add_element("id:post");
        h.handler.handle(&task, &ctx(&task)).await.unwrap();
        let worked = h.knowledge.get_entry(entry.id).await.unwrap();
        assert_eq!((worked.success_count, worked.failure_count), (1, 1));

        // Nothing pending any more.
        h.handler.handle(&task, &ctx(&task)).await.unwrap();
        assert_eq!(h.knowledge.get_entry(entry.id).await.unwrap().success_count, 1);
    }

    #[tokio::test]
    async fn missing_workflow_fails_the_task() {
        let h = harness().await;
        let task = post_task(
            "hello",
            AutomationOptions {
                workflow_id: Some("facebook.unknown".into()),
                ..AutomationOptions::default()
            },
        );
        let err = h.handler.handle(&task, &ctx(&task)).await.unwrap_err();
        assert!(err.to_string().contains("facebook.unknown"));
        assert_eq!(h.knowledge.failure_count(Platform::Facebook, "post_content").await, 1);
    }

    #[tokio::test]
    async fn launch_failure_is_a_worker_fault() {
        let h = harness().await;
        h.launcher.fail_launches(true);
        let task = post_task("hello", AutomationOptions::default());
        let err = h.handler.handle(&task, &ctx(&task)).await.unwrap_err();
        assert!(err.is_fault());
    }

    #[tokio::test]
    async fn cancellation_cancels_the_job() {
        let h = harness_with(browser().with_lookup_delay(Duration::from_millis(200))).await;
        let task = post_task("hello", AutomationOptions::default());
        let ctx = ctx(&task);
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = h.handler.handle(&task, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("job cancelled"));
        // Cancellation is not a failure.
        assert_eq!(h.knowledge.failure_count(Platform::Facebook, "post_content").await, 0);
        let (_, latest) = h.store.get_latest("facebook.post_content").await.unwrap();
        assert_eq!(latest.total_runs(), 0);
    }

    #[test]
    fn payload_values_feed_placeholders() {
        let reply = TaskPayload::ReplyComments {
            post_url: "https://fb.com/p/1".into(),
            reply_text: "thanks!".into(),
            options: AutomationOptions::default(),
        };
        let content = content_for(&reply);
        assert_eq!(content.render("{{post_url}} {{content}}").unwrap(), "https://fb.com/p/1 thanks!");

        let join = TaskPayload::JoinGroups {
            group_urls: vec!["a".into(), "b".into()],
            options: AutomationOptions::default(),
        };
        assert_eq!(content_for(&join).render("{{group_url}}|{{group_urls}}").unwrap(), "a|a,b");
    }
}

//! Engine: wires the components together and owns the background loops.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::automation::{AutomationLauncher, ContentProvider};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::executor::WorkflowExecutor;
use crate::jobs::{JobManager, spawn_job_cleanup};
use crate::knowledge::KnowledgeBase;
use crate::tasks::{
    HandlerRegistry, Orchestrator, TaskHandler, WorkflowTaskHandler, spawn_dispatcher, spawn_retention_sweep,
};
use crate::teaching::{LearningEngine, TeachingRecorder, spawn_session_expiry};
use crate::workers::{BulkOutcome, WorkerPool};
use crate::workflows::WorkflowStore;

/// External dependencies of the engine.
pub struct EngineDeps {
    pub launcher: Arc<dyn AutomationLauncher>,
    /// Credential lookup for workflows that log in.
    pub content_provider: Option<Arc<dyn ContentProvider>>,
}

pub struct Engine {
    config: EngineConfig,
    workflows: Arc<WorkflowStore>,
    knowledge: Arc<KnowledgeBase>,
    jobs: Arc<JobManager>,
    learning: Arc<LearningEngine>,
    recorder: Arc<TeachingRecorder>,
    pool: Arc<WorkerPool>,
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build every component and create the configured workers. Background
    /// loops start with [`Engine::start`].
    pub async fn new(config: EngineConfig, deps: EngineDeps) -> Result<Self> {
        let workflows = Arc::new(WorkflowStore::new(config.workflows.clone()));
        let knowledge = Arc::new(KnowledgeBase::new(config.knowledge.clone()));
        let executor = Arc::new(WorkflowExecutor::new(Arc::clone(&deps.launcher), &config.executor));

        let mut jobs = JobManager::new(Arc::clone(&workflows), executor, config.jobs.clone());
        if let Some(provider) = deps.content_provider {
            jobs = jobs.with_content_provider(provider);
        }
        let jobs = Arc::new(jobs);

        let learning = Arc::new(LearningEngine::new(Arc::clone(&workflows), config.teaching.clone()));
        let recorder = Arc::new(TeachingRecorder::new(
            deps.launcher,
            Arc::clone(&learning),
            config.teaching.clone(),
        ));

        let pool = Arc::new(WorkerPool::new(&config.workers));
        pool.initialize(&config.workers.workers).await?;

        let handlers = Arc::new(HandlerRegistry::new());
        for handler in WorkflowTaskHandler::for_all_automation_types(&jobs, &knowledge) {
            handlers.register(handler).await;
        }
        let orchestrator = Arc::new(Orchestrator::new(handlers, Arc::clone(&pool), &config.orchestrator));

        tracing::info!(
            workers = config.workers.workers.len(),
            max_pending_tasks = config.orchestrator.max_pending_tasks,
            max_concurrent_jobs = config.jobs.max_concurrent_jobs,
            "Engine ready"
        );

        Ok(Self {
            config,
            workflows,
            knowledge,
            jobs,
            learning,
            recorder,
            pool,
            orchestrator,
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn workflows(&self) -> &Arc<WorkflowStore> {
        &self.workflows
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeBase> {
        &self.knowledge
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn learning(&self) -> &Arc<LearningEngine> {
        &self.learning
    }

    pub fn recorder(&self) -> &Arc<TeachingRecorder> {
        &self.recorder
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Add or replace the handler for a task type, e.g. content generation.
    pub async fn register_handler(&self, handler: Arc<dyn TaskHandler>) {
        self.orchestrator.handlers().register(handler).await;
    }

    /// Spawn the dispatcher, retention, job cleanup and session expiry loops.
    /// Calling it again is a no-op.
    pub async fn start(&self) {
        let mut background = self.background.lock().await;
        if !background.is_empty() || self.shutdown.is_cancelled() {
            return;
        }

        let orch = &self.config.orchestrator;
        background.push(spawn_dispatcher(
            Arc::clone(&self.orchestrator),
            orch.dispatch_interval,
            self.shutdown.clone(),
        ));
        background.push(spawn_retention_sweep(
            Arc::clone(&self.orchestrator),
            orch.retention_interval,
            orch.task_retention,
            self.shutdown.clone(),
        ));
        background.push(spawn_job_cleanup(
            Arc::clone(&self.jobs),
            self.config.jobs.cleanup_interval,
            self.config.jobs.cleanup_max_age,
            self.shutdown.clone(),
        ));
        background.push(spawn_session_expiry(
            Arc::clone(&self.recorder),
            self.config.teaching.expiry_interval,
            self.shutdown.clone(),
        ));

        tracing::info!(loops = background.len(), "Engine started");
    }

    /// Stop the background loops, let in-flight tasks finish, then cancel
    /// whatever jobs and teaching sessions are left.
    pub async fn shutdown(&self) -> BulkOutcome {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background loop ended abnormally");
            }
        }

        let outcome = self.pool.shutdown().await;
        self.jobs.cancel_all();

        for session in self.recorder.list_sessions(None).await {
            if !session.status.is_terminal()
                && let Err(e) = self.recorder.cancel_session(session.id).await
            {
                tracing::warn!(session_id = %session.id, error = %e, "Failed to cancel teaching session");
            }
        }

        tracing::info!(
            stopped = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "Engine shut down"
        );
        outcome
    }
}

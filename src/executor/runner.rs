//! Workflow replay.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::automation::{
    AutomationContext, AutomationLauncher, ElementHandle, ExecutionContent, HeuristicResolver,
    ResolveError, ResolveRequest, ResolverChain, SelectorResolver,
};
use crate::config::ExecutorConfig;
use crate::error::{AutomationError, Error};
use crate::executor::result::{ExecutionResult, ProgressEvent, StepResult};
use crate::platform::Platform;
use crate::workflows::{LearnedWorkflow, StepAction, WorkflowStep};

/// Per-run options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionOptions {
    /// Resolve irreversible steps but do not perform them.
    pub dry_run: bool,
}

/// Control and observation channels for one run. Pause is only observed
/// between steps; cancellation also interrupts element lookups and waits.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSignals {
    pub cancel: CancellationToken,
    /// `true` while the run should hold at the next step boundary.
    pub pause: Option<watch::Receiver<bool>>,
    pub progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ExecutionSignals {
    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(event);
        }
    }

    /// Hold while paused. Returns false if cancelled while waiting.
    async fn wait_if_paused(&mut self, before_step: u32) -> bool {
        let Some(pause) = self.pause.as_mut() else {
            return true;
        };
        if !*pause.borrow_and_update() {
            return true;
        }

        if let Some(tx) = &self.progress {
            let _ = tx.send(ProgressEvent::Paused { before_step });
        }
        tracing::debug!(step = before_step, "Execution paused at step boundary");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = pause.changed() => {
                    if changed.is_err() || !*pause.borrow_and_update() {
                        break;
                    }
                }
            }
        }

        if let Some(tx) = &self.progress {
            let _ = tx.send(ProgressEvent::Resumed { step: before_step });
        }
        true
    }
}

enum StepFailure {
    Unresolved(String),
    Action(String),
    /// Cancelled mid-step; the step is discarded, not reported.
    Cancelled,
}

impl From<ResolveError> for StepFailure {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Cancelled => Self::Cancelled,
            ResolveError::Unresolved(reason) => Self::Unresolved(reason),
        }
    }
}

impl From<String> for StepFailure {
    fn from(message: String) -> Self {
        Self::Action(message)
    }
}

struct StepOutcome {
    resolution: Option<crate::automation::Resolution>,
    skipped: bool,
}

/// Replays learned workflows against fresh automation contexts.
pub struct WorkflowExecutor {
    launcher: Arc<dyn AutomationLauncher>,
    resolvers: ResolverChain,
}

impl WorkflowExecutor {
    /// Executor with the stored-selector resolver and the heuristic fallback.
    pub fn new(launcher: Arc<dyn AutomationLauncher>, config: &ExecutorConfig) -> Self {
        let resolvers = ResolverChain::new(Arc::new(SelectorResolver), config.element_timeout)
            .with_fallback(Arc::new(HeuristicResolver));
        Self::with_resolvers(launcher, resolvers)
    }

    pub fn with_resolvers(launcher: Arc<dyn AutomationLauncher>, resolvers: ResolverChain) -> Self {
        Self { launcher, resolvers }
    }

    /// Run every step in order, stopping at the first failure. Never returns
    /// an error: failures are reported in the result.
    pub async fn execute(
        &self,
        platform: Platform,
        workflow: &LearnedWorkflow,
        content: &ExecutionContent,
        options: ExecutionOptions,
        mut signals: ExecutionSignals,
    ) -> ExecutionResult {
        let started_at = Utc::now();
        let total = workflow.steps.len() as u32;
        let mut result = ExecutionResult {
            workflow_id: workflow.workflow_id.clone(),
            version: workflow.version,
            success: false,
            failed_at_step: None,
            cancelled: false,
            dry_run: options.dry_run,
            total_steps: total,
            step_results: Vec::with_capacity(workflow.steps.len()),
            started_at,
            finished_at: started_at,
            error: None,
        };

        tracing::info!(
            workflow_id = %workflow.workflow_id,
            version = workflow.version,
            steps = total,
            dry_run = options.dry_run,
            "Executing workflow"
        );

        let mut ctx = match self.launcher.launch(platform).await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::error!(workflow_id = %workflow.workflow_id, error = %e, "Failed to launch automation context");
                result.error = Some(Error::from(e).to_string());
                result.finished_at = Utc::now();
                return result;
            }
        };

        for (index, step) in workflow.steps.iter().enumerate() {
            let index = index as u32;
            if signals.cancel.is_cancelled() || !signals.wait_if_paused(step.order).await {
                result.cancelled = true;
                break;
            }

            signals.emit(ProgressEvent::StepStarted {
                step: step.order,
                index,
                total,
                description: step.description.clone(),
            });

            let clock = Instant::now();
            let outcome = self
                .run_step(ctx.as_mut(), step, content, options.dry_run, &signals.cancel)
                .await;
            let duration_ms = clock.elapsed().as_millis() as u64;

            if matches!(outcome, Err(StepFailure::Cancelled)) {
                tracing::debug!(step = step.order, "Execution cancelled mid-step");
                result.cancelled = true;
                break;
            }

            let step_result = match outcome {
                Ok(done) => StepResult {
                    step: step.order,
                    action: step.action,
                    success: true,
                    skipped: done.skipped,
                    resolved_by: done.resolution.as_ref().map(|r| r.source),
                    resolution_failed: false,
                    confidence: done.resolution.as_ref().map(|r| r.confidence),
                    duration_ms,
                    error: None,
                },
                Err(failure) => {
                    let (resolution_failed, message) = match failure {
                        StepFailure::Unresolved(reason) => (
                            true,
                            Error::ElementResolution {
                                step: step.order,
                                reason,
                            }
                            .to_string(),
                        ),
                        StepFailure::Action(message) => (false, message),
                        StepFailure::Cancelled => (false, "cancelled".to_string()),
                    };
                    StepResult {
                        step: step.order,
                        action: step.action,
                        success: false,
                        skipped: false,
                        resolved_by: None,
                        resolution_failed,
                        confidence: None,
                        duration_ms,
                        error: Some(message),
                    }
                }
            };

            let failed = !step_result.success;
            if failed {
                tracing::warn!(
                    workflow_id = %workflow.workflow_id,
                    step = step.order,
                    error = step_result.error.as_deref().unwrap_or_default(),
                    "Workflow step failed"
                );
                result.failed_at_step = Some(step.order);
                result.error = step_result.error.clone();
            }

            let skipped = step_result.skipped;
            result.step_results.push(step_result.clone());
            signals.emit(ProgressEvent::StepFinished {
                result: step_result,
                index,
                total,
            });

            if failed {
                break;
            }

            let wait = step.wait_after();
            if !skipped && !wait.is_zero() {
                tokio::select! {
                    _ = signals.cancel.cancelled() => {
                        result.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        if let Err(e) = ctx.close().await {
            tracing::warn!(workflow_id = %workflow.workflow_id, error = %e, "Failed to close automation context");
        }

        result.success = !result.cancelled
            && result.failed_at_step.is_none()
            && result.step_results.len() == workflow.steps.len();
        if result.cancelled && result.error.is_none() {
            result.error = Some("execution cancelled".to_string());
        }
        result.finished_at = Utc::now();

        tracing::info!(
            workflow_id = %result.workflow_id,
            version = result.version,
            success = result.success,
            cancelled = result.cancelled,
            steps_run = result.step_results.len(),
            duration_ms = result.duration_ms(),
            "Workflow execution finished"
        );
        result
    }

    async fn run_step(
        &self,
        ctx: &mut dyn AutomationContext,
        step: &WorkflowStep,
        content: &ExecutionContent,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, StepFailure> {
        let resolution = match &step.selector {
            Some(selector) if step.action.needs_element() || step.action == StepAction::Scroll => {
                let request = ResolveRequest {
                    selector,
                    action: step.action,
                    description: &step.description,
                };
                Some(self.resolvers.resolve(ctx, &request, cancel).await?)
            }
            _ => None,
        };

        if dry_run && step.irreversible {
            tracing::info!(step = step.order, action = %step.action, "Dry run: skipping irreversible step");
            return Ok(StepOutcome {
                resolution,
                skipped: true,
            });
        }

        let handle = resolution.as_ref().map(|r| &r.handle);
        perform(ctx, step, handle, content, cancel).await?;

        Ok(StepOutcome {
            resolution,
            skipped: false,
        })
    }
}

fn render_input(step: &WorkflowStep, content: &ExecutionContent) -> Result<String, String> {
    let template = step.input.as_deref().unwrap_or_default();
    content.render(template).map_err(|e| e.to_string())
}

fn required<'a>(step: &WorkflowStep, handle: Option<&'a ElementHandle>) -> Result<&'a ElementHandle, String> {
    handle.ok_or_else(|| format!("step {} ({}) has no element", step.order, step.action))
}

async fn perform(
    ctx: &mut dyn AutomationContext,
    step: &WorkflowStep,
    handle: Option<&ElementHandle>,
    content: &ExecutionContent,
    cancel: &CancellationToken,
) -> Result<(), StepFailure> {
    let action: Result<(), AutomationError> = match step.action {
        StepAction::Click => ctx.click(required(step, handle)?).await,
        StepAction::Type => {
            let text = render_input(step, content)?;
            ctx.type_text(required(step, handle)?, &text).await
        }
        StepAction::Upload => {
            let files = content
                .upload_files(step.input.as_deref().unwrap_or_default())
                .map_err(|e| StepFailure::Action(e.to_string()))?;
            ctx.upload(required(step, handle)?, &files).await
        }
        StepAction::Select => {
            let value = render_input(step, content)?;
            ctx.select_option(required(step, handle)?, &value).await
        }
        StepAction::Navigate => {
            let url = render_input(step, content)?;
            ctx.navigate(&url).await
        }
        StepAction::Scroll => ctx.scroll(handle).await,
        StepAction::PressKey => {
            let key = match step.input.as_deref() {
                Some(_) => render_input(step, content)?,
                None => "Enter".to_string(),
            };
            ctx.press_key(&key).await
        }
        StepAction::Wait => {
            let millis = step
                .input
                .as_deref()
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .unwrap_or(0);
            tokio::select! {
                _ = cancel.cancelled() => return Err(StepFailure::Cancelled),
                res = ctx.wait(Duration::from_millis(millis)) => res,
            }
        }
    };
    action.map_err(|e| StepFailure::Action(e.to_string()))
}

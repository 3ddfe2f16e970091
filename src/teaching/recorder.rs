//! Teaching sessions: record a human demonstration and hand it to the
//! learning engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::automation::{AutomationContext, AutomationLauncher, RawAction};
use crate::config::TeachingConfig;
use crate::error::{AutomationError, Error, Result};
use crate::store::{KeyedStore, MemoryStore};
use crate::teaching::learning::LearningEngine;
use crate::teaching::session::{SessionStatus, StartSession, TeachingSession, TeachingStep};
use crate::workflows::{LearnedWorkflow, WorkflowStep};

type SharedContext = Arc<Mutex<Box<dyn AutomationContext>>>;

pub struct TeachingRecorder {
    sessions: Arc<dyn KeyedStore<Uuid, TeachingSession>>,
    /// Live automation context per open session.
    contexts: RwLock<HashMap<Uuid, SharedContext>>,
    launcher: Arc<dyn AutomationLauncher>,
    learning: Arc<LearningEngine>,
    config: TeachingConfig,
}

impl TeachingRecorder {
    pub fn new(
        launcher: Arc<dyn AutomationLauncher>,
        learning: Arc<LearningEngine>,
        config: TeachingConfig,
    ) -> Self {
        Self {
            sessions: Arc::new(MemoryStore::new("teaching session")),
            contexts: RwLock::new(HashMap::new()),
            launcher,
            learning,
            config,
        }
    }

    /// Launch a context, open the start page and begin recording.
    pub async fn start_session(&self, request: StartSession) -> Result<TeachingSession> {
        if request.workflow_type.trim().is_empty() {
            return Err(Error::Validation("workflow type must not be empty".to_string()));
        }
        if request.user_id.trim().is_empty() {
            return Err(Error::Validation("user id must not be empty".to_string()));
        }

        let mut session = TeachingSession::new(&request);
        let mut ctx = self.launcher.launch(request.platform).await?;

        let prepared = async {
            if let Some(url) = &request.start_url {
                ctx.navigate(url).await?;
            }
            ctx.start_recording().await
        }
        .await;
        if let Err(e) = prepared {
            if let Err(close_err) = ctx.close().await {
                tracing::warn!(error = %close_err, "Failed to close context after start failure");
            }
            return Err(e.into());
        }

        session.transition_to(SessionStatus::Recording)?;
        self.contexts
            .write()
            .await
            .insert(session.id, Arc::new(Mutex::new(ctx)));
        self.sessions.insert(session.id, session.clone()).await?;

        tracing::info!(
            session_id = %session.id,
            platform = %session.platform,
            workflow_type = %session.workflow_type,
            "Teaching session started"
        );
        Ok(session)
    }

    /// Flush the actions recorded since the last step and append them as one
    /// annotated step. Recording resumes before the screenshot is taken; if it
    /// cannot resume, the flushed actions are kept and the session fails.
    pub async fn add_step(&self, session_id: Uuid, instruction: Option<String>) -> Result<TeachingStep> {
        self.require_recording(session_id, "add a step").await?;
        let ctx = self.context(session_id).await?;
        let mut guard = ctx.lock().await;

        let mut actions = guard.stop_recording().await?;
        let restarted = guard.start_recording().await;

        if actions.is_empty() {
            drop(guard);
            if let Err(e) = restarted {
                self.fail_session(session_id, &e).await;
                return Err(e.into());
            }
            return Err(Error::Validation(format!(
                "no actions recorded since the last step of session {session_id}"
            )));
        }

        let screenshot = match guard.screenshot().await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Screenshot failed");
                None
            }
        };
        drop(guard);
        if let Some(last) = actions.last_mut() {
            last.instruction = instruction.clone();
            last.screenshot = screenshot;
        }

        let updated = self
            .sessions
            .update(
                &session_id,
                Box::new(move |s: &mut TeachingSession| {
                    s.push_step(instruction, actions)?;
                    Ok(())
                }),
            )
            .await?;

        let step = updated
            .steps
            .last()
            .cloned()
            .ok_or_else(|| Error::Teaching("step was not recorded".to_string()))?;

        if let Err(e) = restarted {
            self.fail_session(session_id, &e).await;
            return Err(e.into());
        }

        tracing::debug!(
            session_id = %session_id,
            step = step.index,
            actions = step.actions.len(),
            "Teaching step added"
        );
        Ok(step)
    }

    /// The steps the learning engine would produce right now.
    pub async fn preview(&self, session_id: Uuid) -> Result<Vec<WorkflowStep>> {
        let session = self.get_session(session_id).await?;
        self.learning.build_steps(&session)
    }

    /// Learn the demonstration, save it as a new workflow version and close
    /// the context. A session with no steps stays open.
    pub async fn complete_session(&self, session_id: Uuid) -> Result<LearnedWorkflow> {
        self.require_recording(session_id, "complete").await?;
        let ctx = self.context(session_id).await?;
        let mut guard = ctx.lock().await;

        let remaining = guard.stop_recording().await?;
        if !remaining.is_empty() {
            self.append_actions(session_id, remaining).await?;
        }

        let session = self.get_session(session_id).await?;
        let learned = if session.step_count() == 0 {
            Err(Error::Teaching(format!("session {session_id} has no recorded steps")))
        } else {
            self.learning.learn(&session).await
        };
        let learned = match learned {
            Ok(learned) => learned,
            Err(e) => {
                let restarted = guard.start_recording().await;
                drop(guard);
                if let Err(restart) = restarted {
                    self.fail_session(session_id, &restart).await;
                }
                return Err(e);
            }
        };

        let learned_ref = (learned.workflow_id.clone(), learned.version);
        self.sessions
            .update(
                &session_id,
                Box::new(move |s: &mut TeachingSession| {
                    s.transition_to(SessionStatus::Completed)?;
                    s.learned = Some(learned_ref);
                    Ok(())
                }),
            )
            .await?;

        drop(guard);
        self.dispose_context(session_id).await;

        tracing::info!(
            session_id = %session_id,
            workflow_id = %learned.workflow_id,
            version = learned.version,
            "Teaching session completed"
        );
        Ok(learned)
    }

    /// Discard the session and close its context.
    pub async fn cancel_session(&self, session_id: Uuid) -> Result<TeachingSession> {
        let result = self
            .sessions
            .update(
                &session_id,
                Box::new(|s: &mut TeachingSession| {
                    s.transition_to(SessionStatus::Cancelled)?;
                    s.steps.clear();
                    Ok(())
                }),
            )
            .await;
        self.dispose_context(session_id).await;

        let session = result?;
        tracing::info!(session_id = %session_id, "Teaching session cancelled");
        Ok(session)
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<TeachingSession> {
        self.sessions
            .get(&session_id)
            .await
            .ok_or_else(|| Error::not_found("teaching session", session_id))
    }

    /// Sessions, oldest first, optionally for one user.
    pub async fn list_sessions(&self, user_id: Option<&str>) -> Vec<TeachingSession> {
        let mut sessions: Vec<TeachingSession> = self
            .sessions
            .snapshot()
            .await
            .into_iter()
            .filter(|s| user_id.is_none_or(|u| s.user_id == u))
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Cancel open sessions idle for longer than the session timeout.
    pub async fn expire_stale_sessions(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let timeout = self.config.session_timeout;
        let stale: Vec<Uuid> = self
            .sessions
            .snapshot()
            .await
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .filter(|s| (now - s.updated_at).to_std().unwrap_or_default() > timeout)
            .map(|s| s.id)
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            match self.cancel_session(id).await {
                Ok(_) => {
                    tracing::info!(session_id = %id, "Expired idle teaching session");
                    expired.push(id);
                }
                Err(e) => tracing::debug!(session_id = %id, error = %e, "Session expiry skipped"),
            }
        }
        expired
    }

    /// Number of sessions holding a live context.
    pub async fn open_contexts(&self) -> usize {
        self.contexts.read().await.len()
    }

    async fn require_recording(&self, session_id: Uuid, action: &str) -> Result<()> {
        let session = self.get_session(session_id).await?;
        if session.status != SessionStatus::Recording {
            return Err(Error::conflict("teaching session", session_id, session.status, action));
        }
        Ok(())
    }

    async fn context(&self, session_id: Uuid) -> Result<SharedContext> {
        self.contexts
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or_else(|| Error::not_found("automation context", session_id))
    }

    async fn append_actions(&self, session_id: Uuid, actions: Vec<RawAction>) -> Result<()> {
        self.sessions
            .update(
                &session_id,
                Box::new(move |s: &mut TeachingSession| {
                    s.push_step(None, actions)?;
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }

    /// Mark the session failed, keeping its steps, and close the context.
    async fn fail_session(&self, session_id: Uuid, reason: &AutomationError) {
        let message = reason.to_string();
        let failed = self
            .sessions
            .update(
                &session_id,
                Box::new(move |s: &mut TeachingSession| {
                    s.transition_to(SessionStatus::Failed)?;
                    s.error = Some(message);
                    Ok(())
                }),
            )
            .await;
        self.dispose_context(session_id).await;

        match failed {
            Ok(session) => tracing::warn!(
                session_id = %session_id,
                steps = session.step_count(),
                error = %reason,
                "Teaching session failed: recording could not resume"
            ),
            Err(e) => tracing::debug!(session_id = %session_id, error = %e, "Session already finished"),
        }
    }

    async fn dispose_context(&self, session_id: Uuid) {
        let Some(ctx) = self.contexts.write().await.remove(&session_id) else {
            return;
        };
        let mut ctx = ctx.lock().await;
        if let Err(e) = ctx.close().await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to close automation context");
        }
    }
}

/// Periodically cancel idle teaching sessions until `shutdown` fires.
pub fn spawn_session_expiry(
    recorder: Arc<TeachingRecorder>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    recorder.expire_stale_sessions().await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{ElementFingerprint, RawActionKind};
    use crate::config::WorkflowStoreConfig;
    use crate::platform::Platform;
    use crate::testing::FakeLauncher;
    use crate::workflows::WorkflowStore;

    struct Harness {
        recorder: TeachingRecorder,
        launcher: FakeLauncher,
        store: Arc<WorkflowStore>,
    }

    fn harness(config: TeachingConfig) -> Harness {
        let launcher = FakeLauncher::default();
        let store = Arc::new(WorkflowStore::new(WorkflowStoreConfig::default()));
        let learning = Arc::new(LearningEngine::new(Arc::clone(&store), config.clone()));
        Harness {
            recorder: TeachingRecorder::new(Arc::new(launcher.clone()), learning, config),
            launcher,
            store,
        }
    }

    fn request() -> StartSession {
        StartSession {
            platform: Platform::Facebook,
            workflow_type: "post_content".into(),
            start_url: Some("https://facebook.com".into()),
            user_id: "u1".into(),
        }
    }

    fn click(id: &str) -> RawAction {
        RawAction::new(RawActionKind::Click).with_target(ElementFingerprint {
            element_id: Some(id.into()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn teach_two_steps_and_complete() {
        let h = harness(TeachingConfig::default());
        let session = h.recorder.start_session(request()).await.unwrap();
        assert_eq!(session.status, SessionStatus::Recording);
        let browser = h.launcher.browser();
        assert!(browser.is_recording());
        assert_eq!(browser.journal(), vec!["navigate:https://facebook.com"]);

        browser.user_action(click("composer"));
        let step = h
            .recorder
            .add_step(session.id, Some("Open the composer".into()))
            .await
            .unwrap();
        assert_eq!(step.index, 1);
        let last = step.actions.last().unwrap();
        assert_eq!(last.instruction.as_deref(), Some("Open the composer"));
        assert!(last.screenshot.is_some());
        assert!(browser.journal().contains(&"screenshot:recording".to_string()));

        browser.user_action(click("post"));
        h.recorder.add_step(session.id, Some("Click Post".into())).await.unwrap();

        let preview = h.recorder.preview(session.id).await.unwrap();
        assert_eq!(preview.len(), 2);
        assert!(h.store.get("facebook.post_content").await.is_err());

        let learned = h.recorder.complete_session(session.id).await.unwrap();
        assert_eq!(learned.version, 1);
        assert_eq!(learned.steps.len(), 2);
        assert!(learned.steps[1].irreversible);

        let done = h.recorder.get_session(session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.learned, Some(("facebook.post_content".to_string(), 1)));
        assert_eq!(browser.closed_count(), 1);
        assert_eq!(h.recorder.open_contexts().await, 0);
    }

    #[tokio::test]
    async fn add_step_without_actions_is_rejected() {
        let h = harness(TeachingConfig::default());
        let session = h.recorder.start_session(request()).await.unwrap();
        let err = h.recorder.add_step(session.id, None).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(h.launcher.browser().is_recording());
    }

    #[tokio::test]
    async fn completing_with_zero_steps_fails_and_keeps_session_open() {
        let h = harness(TeachingConfig::default());
        let session = h.recorder.start_session(request()).await.unwrap();
        let err = h.recorder.complete_session(session.id).await.unwrap_err();
        assert!(matches!(err, Error::Teaching(_)));
        assert_eq!(
            h.recorder.get_session(session.id).await.unwrap().status,
            SessionStatus::Recording
        );
    }

    #[tokio::test]
    async fn complete_flushes_unannotated_tail() {
        let h = harness(TeachingConfig::default());
        let session = h.recorder.start_session(request()).await.unwrap();
        h.launcher.browser().user_action(click("post"));
        let learned = h.recorder.complete_session(session.id).await.unwrap();
        assert_eq!(learned.steps.len(), 1);
    }

    #[tokio::test]
    async fn cancel_disposes_context_and_discards_steps() {
        let h = harness(TeachingConfig::default());
        let session = h.recorder.start_session(request()).await.unwrap();
        h.launcher.browser().user_action(click("composer"));
        h.recorder.add_step(session.id, None).await.unwrap();

        let cancelled = h.recorder.cancel_session(session.id).await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
        assert!(cancelled.steps.is_empty());
        assert_eq!(h.launcher.browser().closed_count(), 1);
        assert!(h.recorder.cancel_session(session.id).await.is_err());
        assert!(h.recorder.add_step(session.id, None).await.is_err());
    }

    #[tokio::test]
    async fn failed_recording_restart_keeps_flushed_actions() {
        let h = harness(TeachingConfig::default());
        let session = h.recorder.start_session(request()).await.unwrap();
        let browser = h.launcher.browser();
        browser.user_action(click("composer"));
        browser.user_action(click("post"));
        browser.refuse_recording(true);

        let err = h
            .recorder
            .add_step(session.id, Some("Publish".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Automation(AutomationError::Recording(_))));

        let failed = h.recorder.get_session(session.id).await.unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert!(failed.error.as_deref().unwrap().contains("recorder detached"));
        assert_eq!(failed.steps.len(), 1);
        assert_eq!(failed.steps[0].actions.len(), 2);
        assert_eq!(failed.steps[0].instruction.as_deref(), Some("Publish"));

        assert_eq!(browser.closed_count(), 1);
        assert_eq!(h.recorder.open_contexts().await, 0);
        assert!(h.recorder.add_step(session.id, None).await.is_err());
    }

    #[tokio::test]
    async fn launch_failure_surfaces_as_automation_error() {
        let h = harness(TeachingConfig::default());
        h.launcher.fail_launches(true);
        let err = h.recorder.start_session(request()).await.unwrap_err();
        assert!(matches!(err, Error::Automation(_)));
        assert!(h.recorder.list_sessions(None).await.is_empty());
    }

    #[tokio::test]
    async fn stale_sessions_expire() {
        let config = TeachingConfig {
            session_timeout: Duration::from_millis(10),
            ..TeachingConfig::default()
        };
        let h = harness(config);
        let session = h.recorder.start_session(request()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let expired = h.recorder.expire_stale_sessions().await;
        assert_eq!(expired, vec![session.id]);
        assert_eq!(
            h.recorder.get_session(session.id).await.unwrap().status,
            SessionStatus::Cancelled
        );
        assert!(h.recorder.expire_stale_sessions().await.is_empty());
    }
}

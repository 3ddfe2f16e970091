//! Versioned workflow persistence.
//!
//! Every save appends a version; nothing is overwritten, so jobs bound to an
//! older version keep working. Jobs hold a [`WorkflowLease`] for the version
//! they execute, and a definition cannot be deleted while any lease is alive.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use uuid::Uuid;

use crate::config::WorkflowStoreConfig;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::store::{KeyedStore, MemoryStore};
use crate::workflows::confidence;
use crate::workflows::model::{LearnedWorkflow, NewWorkflow, WorkflowDefinition, validate_steps};

/// Outcome of one executed step, used to adjust its selector confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectorOutcome {
    pub order: u32,
    /// True when the stored selector resolved the element on its own.
    pub success: bool,
}

#[derive(Default)]
struct LeaseState {
    /// workflow id -> (job id -> leased version)
    holders: HashMap<String, HashMap<Uuid, u32>>,
    /// Definitions currently being deleted; no new leases are granted.
    deleting: HashSet<String>,
}

#[derive(Default)]
struct LeaseTable {
    state: Mutex<LeaseState>,
}

impl LeaseTable {
    fn lock(&self) -> MutexGuard<'_, LeaseState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Marks one workflow version as in use by one job. Released on drop.
pub struct WorkflowLease {
    table: Arc<LeaseTable>,
    workflow_id: String,
    version: u32,
    job_id: Uuid,
}

impl WorkflowLease {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

impl std::fmt::Debug for WorkflowLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowLease")
            .field("workflow_id", &self.workflow_id)
            .field("version", &self.version)
            .field("job_id", &self.job_id)
            .finish()
    }
}

impl Drop for WorkflowLease {
    fn drop(&mut self) {
        let mut state = self.table.lock();
        if let Some(jobs) = state.holders.get_mut(&self.workflow_id) {
            jobs.remove(&self.job_id);
            if jobs.is_empty() {
                state.holders.remove(&self.workflow_id);
            }
        }
    }
}

/// Workflow version bound to a job.
#[derive(Debug)]
pub struct LeasedWorkflow {
    pub lease: WorkflowLease,
    pub platform: Platform,
    pub workflow: LearnedWorkflow,
}

/// Versioned store of workflow definitions.
pub struct WorkflowStore {
    definitions: Arc<dyn KeyedStore<String, WorkflowDefinition>>,
    leases: Arc<LeaseTable>,
    config: WorkflowStoreConfig,
}

impl WorkflowStore {
    /// Create a store backed by an in-memory registry.
    pub fn new(config: WorkflowStoreConfig) -> Self {
        Self::with_backend(config, Arc::new(MemoryStore::new("workflow")))
    }

    /// Create a store over an injected registry.
    pub fn with_backend(
        config: WorkflowStoreConfig,
        definitions: Arc<dyn KeyedStore<String, WorkflowDefinition>>,
    ) -> Self {
        Self {
            definitions,
            leases: Arc::new(LeaseTable::default()),
            config,
        }
    }

    /// Save a workflow: version 1 for a new id, otherwise the next version.
    pub async fn save(&self, new: NewWorkflow) -> Result<LearnedWorkflow> {
        if new.id.trim().is_empty() {
            return Err(Error::Validation("workflow id must not be empty".to_string()));
        }
        validate_steps(&new.steps)?;

        let confidence = match new.confidence {
            Some(c) if !(0.0..=1.0).contains(&c) => {
                return Err(Error::Validation(format!(
                    "confidence {c} is outside [0, 1]"
                )));
            }
            Some(c) => c,
            None => confidence::mean(
                new.steps
                    .iter()
                    .filter_map(|s| s.selector.as_ref().map(|sel| sel.confidence)),
            )
            .unwrap_or(0.5),
        };

        let now = Utc::now();
        let draft = LearnedWorkflow {
            workflow_id: new.id.clone(),
            version: 0,
            steps: new.steps.clone(),
            is_human_trained: new.is_human_trained,
            confidence,
            success_count: 0,
            failure_count: 0,
            source_session: new.source_session,
            created_at: now,
            updated_at: now,
        };

        loop {
            let platform = new.platform;
            let task_type = new.task_type.clone();
            let candidate = draft.clone();
            let appended = self
                .definitions
                .update(
                    &new.id,
                    Box::new(move |def: &mut WorkflowDefinition| {
                        if def.platform != platform || def.task_type != task_type {
                            return Err(Error::Validation(format!(
                                "workflow {} belongs to {}/{}, not {}/{}",
                                def.id, def.platform, def.task_type, platform, task_type
                            )));
                        }
                        def.push_version(candidate);
                        Ok(())
                    }),
                )
                .await;

            match appended {
                Ok(def) => {
                    let saved = def
                        .current()
                        .cloned()
                        .ok_or_else(|| Error::not_found("workflow version", &def.id))?;
                    tracing::info!(
                        workflow_id = %saved.workflow_id,
                        version = saved.version,
                        steps = saved.steps.len(),
                        "Saved new workflow version"
                    );
                    return Ok(saved);
                }
                Err(Error::NotFound { .. }) => {
                    let mut def = WorkflowDefinition {
                        id: new.id.clone(),
                        platform: new.platform,
                        task_type: new.task_type.clone(),
                        versions: Default::default(),
                        current_version: 0,
                        is_active: true,
                        created_at: now,
                        updated_at: now,
                    };
                    def.push_version(draft.clone());
                    let saved = def.current().cloned();
                    match self.definitions.insert(new.id.clone(), def).await {
                        Ok(()) => {
                            tracing::info!(workflow_id = %new.id, "Created workflow definition");
                            return saved.ok_or_else(|| Error::not_found("workflow version", &new.id));
                        }
                        // Lost a race with a concurrent first save: append instead.
                        Err(Error::StateConflict { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get(&self, id: &str) -> Result<WorkflowDefinition> {
        self.definitions
            .get(&id.to_string())
            .await
            .ok_or_else(|| Error::not_found("workflow", id))
    }

    /// Exact version lookup.
    pub async fn get_version(&self, id: &str, version: u32) -> Result<LearnedWorkflow> {
        let def = self.get(id).await?;
        def.version(version)
            .cloned()
            .ok_or_else(|| Error::not_found("workflow version", format!("{id}@{version}")))
    }

    /// The definition together with its current version.
    pub async fn get_latest(&self, id: &str) -> Result<(WorkflowDefinition, LearnedWorkflow)> {
        let def = self.get(id).await?;
        let current = def
            .current()
            .cloned()
            .ok_or_else(|| Error::not_found("workflow version", format!("{id}@{}", def.current_version)))?;
        Ok((def, current))
    }

    pub async fn list(&self, platform: Option<Platform>) -> Vec<WorkflowDefinition> {
        let mut defs: Vec<_> = self
            .definitions
            .snapshot()
            .await
            .into_iter()
            .filter(|d| platform.is_none_or(|p| d.platform == p))
            .collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }

    /// Toggle availability for new jobs. Running jobs keep their leased version.
    pub async fn set_active(&self, id: &str, active: bool) -> Result<WorkflowDefinition> {
        let def = self
            .definitions
            .update(
                &id.to_string(),
                Box::new(move |def: &mut WorkflowDefinition| {
                    def.is_active = active;
                    def.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await?;
        tracing::info!(workflow_id = %id, active, "Workflow activation changed");
        Ok(def)
    }

    /// Delete a definition with all its versions. Fails while any job holds a lease.
    pub async fn delete(&self, id: &str) -> Result<WorkflowDefinition> {
        {
            let mut state = self.leases.lock();
            if let Some(jobs) = state.holders.get(id)
                && !jobs.is_empty()
            {
                return Err(Error::conflict(
                    "workflow",
                    id,
                    format!("referenced by {} active job(s)", jobs.len()),
                    "delete",
                ));
            }
            state.deleting.insert(id.to_string());
        }

        let removed = self.definitions.remove(&id.to_string()).await;
        self.leases.lock().deleting.remove(id);

        let def = removed.ok_or_else(|| Error::not_found("workflow", id))?;
        tracing::info!(workflow_id = %id, versions = def.versions.len(), "Deleted workflow");
        Ok(def)
    }

    /// Number of live leases on any version of `id`.
    pub fn active_references(&self, id: &str) -> usize {
        self.leases.lock().holders.get(id).map_or(0, |jobs| jobs.len())
    }

    /// Bind a version of an active workflow to `job_id`.
    ///
    /// `version = None` takes the current version, or the most confident one
    /// when `prefer_confident` is set.
    pub async fn acquire(
        &self,
        id: &str,
        version: Option<u32>,
        job_id: Uuid,
        prefer_confident: bool,
    ) -> Result<LeasedWorkflow> {
        {
            let state = self.leases.lock();
            if state.deleting.contains(id) {
                return Err(Error::not_found("workflow", id));
            }
        }

        let def = self.get(id).await?;
        if !def.is_active {
            return Err(Error::conflict("workflow", id, "inactive", "start a job"));
        }

        let chosen = match version {
            Some(v) => v,
            None if prefer_confident => Self::select_version(&def),
            None => def.current_version,
        };
        let workflow = def
            .version(chosen)
            .cloned()
            .ok_or_else(|| Error::not_found("workflow version", format!("{id}@{chosen}")))?;

        {
            let mut state = self.leases.lock();
            if state.deleting.contains(id) {
                return Err(Error::not_found("workflow", id));
            }
            state
                .holders
                .entry(id.to_string())
                .or_default()
                .insert(job_id, chosen);
        }

        let lease = WorkflowLease {
            table: Arc::clone(&self.leases),
            workflow_id: id.to_string(),
            version: chosen,
            job_id,
        };

        // The definition may have been deleted between the read and the pin.
        if self.definitions.get(&id.to_string()).await.is_none() {
            return Err(Error::not_found("workflow", id));
        }

        Ok(LeasedWorkflow {
            lease,
            platform: def.platform,
            workflow,
        })
    }

    /// Highest-confidence version; ties go to the newest.
    pub fn select_version(def: &WorkflowDefinition) -> u32 {
        def.versions
            .values()
            .max_by(|a, b| {
                a.confidence
                    .total_cmp(&b.confidence)
                    .then(a.version.cmp(&b.version))
            })
            .map_or(def.current_version, |w| w.version)
    }

    /// Fold one execution into the version's counters and confidence scores.
    pub async fn record_execution(
        &self,
        id: &str,
        version: u32,
        success: bool,
        selector_outcomes: &[SelectorOutcome],
    ) -> Result<LearnedWorkflow> {
        let alpha = self.config.confidence_alpha;
        let outcomes = selector_outcomes.to_vec();
        let def = self
            .definitions
            .update(
                &id.to_string(),
                Box::new(move |def: &mut WorkflowDefinition| {
                    let def_id = def.id.clone();
                    let workflow = def.versions.get_mut(&version).ok_or_else(|| {
                        Error::not_found("workflow version", format!("{def_id}@{version}"))
                    })?;
                    if success {
                        workflow.success_count += 1;
                    } else {
                        workflow.failure_count += 1;
                    }
                    workflow.confidence = confidence::apply_outcome(workflow.confidence, success, alpha);

                    for outcome in &outcomes {
                        if let Some(selector) = workflow
                            .steps
                            .iter_mut()
                            .find(|s| s.order == outcome.order)
                            .and_then(|s| s.selector.as_mut())
                        {
                            selector.confidence =
                                confidence::apply_outcome(selector.confidence, outcome.success, alpha);
                        }
                    }
                    workflow.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await?;

        let updated = def
            .version(version)
            .cloned()
            .ok_or_else(|| Error::not_found("workflow version", format!("{id}@{version}")))?;
        tracing::debug!(
            workflow_id = %id,
            version,
            success,
            confidence = updated.confidence,
            "Recorded workflow execution"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::model::{ElementSelector, SelectorKind, StepAction, WorkflowStep};

    fn steps(n: u32) -> Vec<WorkflowStep> {
        (1..=n)
            .map(|i| {
                WorkflowStep::new(i, StepAction::Click, format!("step {i}"))
                    .with_selector(ElementSelector::new(SelectorKind::Id, format!("el-{i}")))
            })
            .collect()
    }

    fn store() -> WorkflowStore {
        WorkflowStore::new(WorkflowStoreConfig::default())
    }

    fn new_post(n: u32) -> NewWorkflow {
        NewWorkflow::for_task(Platform::Facebook, "post_content", steps(n))
    }

    #[tokio::test]
    async fn saving_twice_creates_two_retrievable_versions() {
        let store = store();
        let v1 = store.save(new_post(2)).await.unwrap();
        let v2 = store.save(new_post(3)).await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        let (def, latest) = store.get_latest("facebook.post_content").await.unwrap();
        assert_eq!(def.current_version, 2);
        assert_eq!(latest.steps.len(), 3);

        assert_eq!(store.get_version("facebook.post_content", 1).await.unwrap().steps.len(), 2);
        assert_eq!(store.get_version("facebook.post_content", 2).await.unwrap().steps.len(), 3);
        assert!(store.get_version("facebook.post_content", 3).await.is_err());
    }

    #[tokio::test]
    async fn current_version_tracks_highest_key_under_concurrency() {
        let store = Arc::new(store());
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.save(new_post(1)).await.unwrap() }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let def = store.get("facebook.post_content").await.unwrap();
        assert_eq!(def.versions.len(), 10);
        assert_eq!(def.current_version, *def.versions.keys().max().unwrap());
    }

    #[tokio::test]
    async fn save_rejects_invalid_steps_and_mismatched_platform() {
        let store = store();
        assert!(matches!(
            store.save(new_post(0)).await,
            Err(Error::Validation(_))
        ));

        store.save(new_post(1)).await.unwrap();
        let mut other = NewWorkflow::for_task(Platform::Instagram, "post_content", steps(1));
        other.id = "facebook.post_content".to_string();
        assert!(matches!(store.save(other).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn initial_confidence_is_mean_selector_confidence() {
        let store = store();
        let mut s = steps(2);
        s[1].selector = Some(ElementSelector::new(SelectorKind::Text, "Post"));
        let saved = store
            .save(NewWorkflow::for_task(Platform::Facebook, "post_content", s))
            .await
            .unwrap();
        assert!((saved.confidence - (0.95 + 0.40) / 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn delete_blocked_while_leased() {
        let store = store();
        store.save(new_post(1)).await.unwrap();
        store.save(new_post(2)).await.unwrap();

        let lease = store
            .acquire("facebook.post_content", Some(1), Uuid::new_v4(), false)
            .await
            .unwrap();
        assert_eq!(store.active_references("facebook.post_content"), 1);

        let err = store.delete("facebook.post_content").await.unwrap_err();
        assert!(matches!(err, Error::StateConflict { .. }));

        drop(lease);
        assert_eq!(store.active_references("facebook.post_content"), 0);
        store.delete("facebook.post_content").await.unwrap();
        assert!(store.get("facebook.post_content").await.is_err());
    }

    #[tokio::test]
    async fn inactive_workflow_rejects_new_leases_but_keeps_existing() {
        let store = store();
        store.save(new_post(1)).await.unwrap();
        let held = store
            .acquire("facebook.post_content", None, Uuid::new_v4(), false)
            .await
            .unwrap();

        store.set_active("facebook.post_content", false).await.unwrap();
        let err = store
            .acquire("facebook.post_content", None, Uuid::new_v4(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StateConflict { .. }));

        assert_eq!(held.workflow.version, 1);
        assert_eq!(store.active_references("facebook.post_content"), 1);
    }

    #[tokio::test]
    async fn record_execution_updates_counters_and_confidence() {
        let store = store();
        let saved = store.save(new_post(2)).await.unwrap();

        let after = store
            .record_execution(
                "facebook.post_content",
                1,
                false,
                &[
                    SelectorOutcome { order: 1, success: true },
                    SelectorOutcome { order: 2, success: false },
                ],
            )
            .await
            .unwrap();
        assert_eq!(after.failure_count, 1);
        assert!(after.confidence < saved.confidence);
        let s1 = after.steps[0].selector.as_ref().unwrap().confidence;
        let s2 = after.steps[1].selector.as_ref().unwrap().confidence;
        assert!(s1 > s2);
    }

    #[tokio::test]
    async fn select_version_prefers_confidence_then_newest() {
        let store = store();
        store.save(new_post(1)).await.unwrap();
        store.save(new_post(1)).await.unwrap();
        let def = store.get("facebook.post_content").await.unwrap();
        assert_eq!(WorkflowStore::select_version(&def), 2);

        store
            .record_execution("facebook.post_content", 2, false, &[])
            .await
            .unwrap();
        let def = store.get("facebook.post_content").await.unwrap();
        assert_eq!(WorkflowStore::select_version(&def), 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = store();
        assert!(matches!(store.get("nope").await, Err(Error::NotFound { .. })));
        assert!(matches!(store.delete("nope").await, Err(Error::NotFound { .. })));
        assert!(matches!(
            store.set_active("nope", true).await,
            Err(Error::NotFound { .. })
        ));
    }
}

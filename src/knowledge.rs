//! Knowledge base of known automation errors and their fixes, plus the
//! consecutive-failure counters that decide when to hand a task to a human.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::KnowledgeConfig;
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::store::{KeyedStore, MemoryStore};

/// A known error and how to deal with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: Uuid,
    pub platform: Platform,
    /// Case-insensitive regular expression matched against error text.
    pub error_pattern: String,
    pub solution: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeEntry {
    /// Laplace-smoothed success ratio, 0.5 for an untried entry.
    pub fn score(&self) -> f64 {
        (self.success_count as f64 + 1.0) / ((self.success_count + self.failure_count) as f64 + 2.0)
    }
}

/// Best entry for an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SolutionMatch {
    pub entry: KnowledgeEntry,
    pub score: f64,
}

/// Consecutive failures for one platform / task type pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCounter {
    pub platform: Platform,
    pub task_type: String,
    pub consecutive: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
}

fn counter_key(platform: Platform, task_type: &str) -> String {
    format!("{platform}/{task_type}")
}

fn compile(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(1 << 20)
        .build()
        .map_err(|e| Error::Validation(format!("invalid error pattern '{pattern}': {e}")))
}

pub struct KnowledgeBase {
    entries: Arc<dyn KeyedStore<Uuid, KnowledgeEntry>>,
    compiled: RwLock<HashMap<Uuid, Regex>>,
    failures: Arc<dyn KeyedStore<String, FailureCounter>>,
    config: KnowledgeConfig,
}

impl KnowledgeBase {
    pub fn new(config: KnowledgeConfig) -> Self {
        Self {
            entries: Arc::new(MemoryStore::new("knowledge entry")),
            compiled: RwLock::new(HashMap::new()),
            failures: Arc::new(MemoryStore::new("failure counter")),
            config,
        }
    }

    pub async fn add_entry(
        &self,
        platform: Platform,
        error_pattern: &str,
        solution: &str,
    ) -> Result<KnowledgeEntry> {
        if error_pattern.trim().is_empty() {
            return Err(Error::Validation("error pattern must not be empty".to_string()));
        }
        if solution.trim().is_empty() {
            return Err(Error::Validation("solution must not be empty".to_string()));
        }
        let regex = compile(error_pattern)?;

        let now = Utc::now();
        let entry = KnowledgeEntry {
            id: Uuid::new_v4(),
            platform,
            error_pattern: error_pattern.to_string(),
            solution: solution.to_string(),
            success_count: 0,
            failure_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.compiled.write().await.insert(entry.id, regex);
        self.entries.insert(entry.id, entry.clone()).await?;

        tracing::info!(entry_id = %entry.id, %platform, pattern = %error_pattern, "Knowledge entry added");
        Ok(entry)
    }

    pub async fn get_entry(&self, entry_id: Uuid) -> Result<KnowledgeEntry> {
        self.entries
            .get(&entry_id)
            .await
            .ok_or_else(|| Error::not_found("knowledge entry", entry_id))
    }

    pub async fn remove_entry(&self, entry_id: Uuid) -> Result<KnowledgeEntry> {
        self.compiled.write().await.remove(&entry_id);
        self.entries
            .remove(&entry_id)
            .await
            .ok_or_else(|| Error::not_found("knowledge entry", entry_id))
    }

    /// Best known solution for `error_text`: highest smoothed success ratio,
    /// then the longest (most specific) pattern.
    pub async fn find_solution(&self, platform: Platform, error_text: &str) -> Option<SolutionMatch> {
        let candidates: Vec<KnowledgeEntry> = self
            .entries
            .snapshot()
            .await
            .into_iter()
            .filter(|e| e.platform == platform)
            .collect();

        let compiled = self.compiled.read().await;
        candidates
            .into_iter()
            .filter(|e| compiled.get(&e.id).is_some_and(|re| re.is_match(error_text)))
            .max_by(|a, b| {
                a.score()
                    .total_cmp(&b.score())
                    .then(a.error_pattern.len().cmp(&b.error_pattern.len()))
                    .then(b.created_at.cmp(&a.created_at))
            })
            .map(|entry| SolutionMatch {
                score: entry.score(),
                entry,
            })
    }

    /// Record whether applying an entry's solution worked.
    pub async fn record_outcome(&self, entry_id: Uuid, success: bool) -> Result<KnowledgeEntry> {
        let entry = self
            .entries
            .update(
                &entry_id,
                Box::new(move |e: &mut KnowledgeEntry| {
                    if success {
                        e.success_count += 1;
                    } else {
                        e.failure_count += 1;
                    }
                    e.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await?;
        tracing::debug!(entry_id = %entry_id, success, score = entry.score(), "Knowledge outcome recorded");
        Ok(entry)
    }

    /// Entries whose pattern or solution contains `query` (case-insensitive),
    /// best-scoring first.
    pub async fn search(&self, platform: Option<Platform>, query: &str) -> Vec<KnowledgeEntry> {
        let needle = query.trim().to_lowercase();
        let mut found: Vec<KnowledgeEntry> = self
            .entries
            .snapshot()
            .await
            .into_iter()
            .filter(|e| platform.is_none_or(|p| e.platform == p))
            .filter(|e| {
                needle.is_empty()
                    || e.error_pattern.to_lowercase().contains(&needle)
                    || e.solution.to_lowercase().contains(&needle)
            })
            .collect();
        found.sort_by(|a, b| b.score().total_cmp(&a.score()).then(a.created_at.cmp(&b.created_at)));
        found
    }

    /// Count one more consecutive failure; returns the new count.
    pub async fn record_failure(&self, platform: Platform, task_type: &str) -> u32 {
        let key = counter_key(platform, task_type);
        loop {
            let bumped = self
                .failures
                .update(
                    &key,
                    Box::new(|c: &mut FailureCounter| {
                        c.consecutive += 1;
                        c.last_failure_at = Some(Utc::now());
                        Ok(())
                    }),
                )
                .await;
            match bumped {
                Ok(counter) => return self.log_failure(counter),
                Err(_) => {
                    let counter = FailureCounter {
                        platform,
                        task_type: task_type.to_string(),
                        consecutive: 1,
                        last_failure_at: Some(Utc::now()),
                    };
                    if self.failures.insert(key.clone(), counter.clone()).await.is_ok() {
                        return self.log_failure(counter);
                    }
                    // A concurrent failure created the counter first.
                }
            }
        }
    }

    fn log_failure(&self, counter: FailureCounter) -> u32 {
        let escalate = counter.consecutive >= self.config.escalation_threshold;
        if escalate {
            tracing::warn!(
                platform = %counter.platform,
                task_type = %counter.task_type,
                failures = counter.consecutive,
                "Escalation threshold reached"
            );
        } else {
            tracing::debug!(
                platform = %counter.platform,
                task_type = %counter.task_type,
                failures = counter.consecutive,
                "Consecutive failure recorded"
            );
        }
        counter.consecutive
    }

    /// A success breaks the failure streak.
    pub async fn record_success(&self, platform: Platform, task_type: &str) {
        self.reset_failure_count(platform, task_type).await;
    }

    pub async fn failure_count(&self, platform: Platform, task_type: &str) -> u32 {
        self.failures
            .get(&counter_key(platform, task_type))
            .await
            .map_or(0, |c| c.consecutive)
    }

    pub async fn should_escalate_to_human(&self, platform: Platform, task_type: &str) -> bool {
        self.failure_count(platform, task_type).await >= self.config.escalation_threshold
    }

    /// Escalation as an error, for callers that want to stop.
    pub async fn check_escalation(&self, platform: Platform, task_type: &str) -> Result<()> {
        let failures = self.failure_count(platform, task_type).await;
        if failures >= self.config.escalation_threshold {
            return Err(Error::EscalationRequired {
                platform: platform.to_string(),
                task_type: task_type.to_string(),
                failures,
            });
        }
        Ok(())
    }

    pub async fn reset_failure_count(&self, platform: Platform, task_type: &str) {
        if self.failures.remove(&counter_key(platform, task_type)).await.is_some() {
            tracing::debug!(%platform, task_type, "Failure count reset");
        }
    }
}

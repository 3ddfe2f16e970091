//! Configuration types.
//!
//! Every section has a `Default` and a `from_env()` reader. Environment
//! variables are prefixed with `AUTOPILOT_`; unset variables keep the
//! default, malformed ones are reported as [`ConfigError::InvalidValue`].

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::platform::Platform;

/// Full engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub orchestrator: OrchestratorConfig,
    pub workers: WorkerPoolConfig,
    pub executor: ExecutorConfig,
    pub jobs: JobConfig,
    pub teaching: TeachingConfig,
    pub knowledge: KnowledgeConfig,
    pub workflows: WorkflowStoreConfig,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            orchestrator: OrchestratorConfig::from_env()?,
            workers: WorkerPoolConfig::from_env()?,
            executor: ExecutorConfig::from_env()?,
            jobs: JobConfig::from_env()?,
            teaching: TeachingConfig::from_env()?,
            knowledge: KnowledgeConfig::from_env()?,
            workflows: WorkflowStoreConfig::from_env()?,
        })
    }
}

/// Task queue and dispatch settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Pending tasks beyond this are rejected at submit time.
    pub max_pending_tasks: usize,
    /// Fallback dispatch tick (dispatch is also triggered on submit and on worker release).
    pub dispatch_interval: Duration,
    /// How long terminal tasks stay queryable.
    pub task_retention: Duration,
    /// Retention sweep interval.
    pub retention_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_pending_tasks: 1_000,
            dispatch_interval: Duration::from_secs(1),
            task_retention: Duration::from_secs(24 * 3600),
            retention_interval: Duration::from_secs(600),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            max_pending_tasks: env_or("AUTOPILOT_MAX_PENDING_TASKS", d.max_pending_tasks)?,
            dispatch_interval: env_millis("AUTOPILOT_DISPATCH_INTERVAL_MS", d.dispatch_interval)?,
            task_retention: env_secs("AUTOPILOT_TASK_RETENTION_SECS", d.task_retention)?,
            retention_interval: env_secs("AUTOPILOT_RETENTION_INTERVAL_SECS", d.retention_interval)?,
        })
    }
}

/// A worker created at pool initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub name: String,
    pub platform: Platform,
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: Vec<WorkerSpec>,
    /// Maximum worker reports kept in history.
    pub max_reports: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            max_reports: 1_000,
        }
    }
}

impl WorkerPoolConfig {
    /// `AUTOPILOT_WORKERS` takes `platform:count` pairs, e.g. `facebook:2,instagram:1`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let workers = match std::env::var("AUTOPILOT_WORKERS") {
            Ok(raw) => parse_worker_specs(&raw)?,
            Err(_) => d.workers,
        };
        Ok(Self {
            workers,
            max_reports: env_or("AUTOPILOT_MAX_REPORTS", d.max_reports)?,
        })
    }
}

/// Parse `platform:count` pairs into named worker specs.
pub fn parse_worker_specs(raw: &str) -> Result<Vec<WorkerSpec>, ConfigError> {
    let mut specs = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (platform, count) = part.split_once(':').unwrap_or((part, "1"));
        let platform: Platform = platform.trim().parse().map_err(|e: String| {
            ConfigError::InvalidValue {
                key: "AUTOPILOT_WORKERS".to_string(),
                message: e,
            }
        })?;
        let count: usize = count.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: "AUTOPILOT_WORKERS".to_string(),
            message: format!("invalid worker count in '{part}'"),
        })?;
        for i in 1..=count {
            specs.push(WorkerSpec {
                name: format!("{platform}-worker-{i}"),
                platform,
            });
        }
    }
    Ok(specs)
}

/// Workflow replay settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-step element resolution timeout (applies to each resolver attempt).
    pub element_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            element_timeout: Duration::from_secs(10),
        }
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            element_timeout: env_millis("AUTOPILOT_ELEMENT_TIMEOUT_MS", d.element_timeout)?,
        })
    }
}

/// Active job settings.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub max_concurrent_jobs: usize,
    /// Wall-clock limit per job; `None` disables it.
    pub job_timeout: Option<Duration>,
    pub cleanup_interval: Duration,
    pub cleanup_max_age: Duration,
    pub max_log_entries: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            job_timeout: Some(Duration::from_secs(900)),
            cleanup_interval: Duration::from_secs(300),
            cleanup_max_age: Duration::from_secs(3600),
            max_log_entries: 200,
        }
    }
}

impl JobConfig {
    /// `AUTOPILOT_JOB_TIMEOUT_SECS=0` disables the wall-clock limit.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let job_timeout = Some(env_secs(
            "AUTOPILOT_JOB_TIMEOUT_SECS",
            d.job_timeout.unwrap_or(Duration::ZERO),
        )?)
        .filter(|t| !t.is_zero());
        Ok(Self {
            max_concurrent_jobs: env_or("AUTOPILOT_MAX_CONCURRENT_JOBS", d.max_concurrent_jobs)?,
            job_timeout,
            cleanup_interval: env_secs("AUTOPILOT_JOB_CLEANUP_INTERVAL_SECS", d.cleanup_interval)?,
            cleanup_max_age: env_secs("AUTOPILOT_JOB_MAX_AGE_SECS", d.cleanup_max_age)?,
            max_log_entries: env_or("AUTOPILOT_JOB_MAX_LOG_ENTRIES", d.max_log_entries)?,
        })
    }
}

/// Teaching and learning settings.
#[derive(Debug, Clone)]
pub struct TeachingConfig {
    /// Sessions older than this are cancelled by the expiry sweep.
    pub session_timeout: Duration,
    pub expiry_interval: Duration,
    pub min_step_wait: Duration,
    pub max_step_wait: Duration,
    /// CSS paths with at most this many segments count as "short".
    pub short_path_segments: usize,
}

impl Default for TeachingConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(3600),
            expiry_interval: Duration::from_secs(60),
            min_step_wait: Duration::from_millis(500),
            max_step_wait: Duration::from_secs(5),
            short_path_segments: 4,
        }
    }
}

impl TeachingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            session_timeout: env_secs("AUTOPILOT_TEACHING_TIMEOUT_SECS", d.session_timeout)?,
            expiry_interval: env_secs("AUTOPILOT_TEACHING_EXPIRY_INTERVAL_SECS", d.expiry_interval)?,
            min_step_wait: env_millis("AUTOPILOT_MIN_STEP_WAIT_MS", d.min_step_wait)?,
            max_step_wait: env_millis("AUTOPILOT_MAX_STEP_WAIT_MS", d.max_step_wait)?,
            short_path_segments: env_or("AUTOPILOT_SHORT_PATH_SEGMENTS", d.short_path_segments)?,
        })
    }
}

/// Knowledge base settings.
#[derive(Debug, Clone)]
pub struct KnowledgeConfig {
    /// Consecutive failures for a (platform, task type) pair before escalating.
    pub escalation_threshold: u32,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            escalation_threshold: 3,
        }
    }
}

impl KnowledgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            escalation_threshold: env_or("AUTOPILOT_ESCALATION_THRESHOLD", d.escalation_threshold)?,
        })
    }
}

/// Workflow store settings.
#[derive(Debug, Clone)]
pub struct WorkflowStoreConfig {
    /// Weight of the latest outcome in the confidence moving average.
    pub confidence_alpha: f64,
}

impl Default for WorkflowStoreConfig {
    fn default() -> Self {
        Self {
            confidence_alpha: 0.2,
        }
    }
}

impl WorkflowStoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let confidence_alpha = env_or("AUTOPILOT_CONFIDENCE_ALPHA", d.confidence_alpha)?;
        if !(confidence_alpha > 0.0 && confidence_alpha <= 1.0) {
            return Err(ConfigError::InvalidValue {
                key: "AUTOPILOT_CONFIDENCE_ALPHA".to_string(),
                message: format!("must be in (0, 1], got {confidence_alpha}"),
            });
        }
        Ok(Self { confidence_alpha })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_millis() as u64).map(Duration::from_millis)
}

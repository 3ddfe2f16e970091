//! Error types for the automation core.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} is {state}, cannot {action}")]
    StateConflict {
        entity: &'static str,
        id: String,
        state: String,
        action: String,
    },

    #[error("Element resolution failed at step {step}: {reason}")]
    ElementResolution { step: u32, reason: String },

    #[error("Execution fault: {0}")]
    ExecutionFault(String),

    #[error("Escalation required for {platform}/{task_type} after {failures} consecutive failures")]
    EscalationRequired {
        platform: String,
        task_type: String,
        failures: u32,
    },

    #[error("Workflow {workflow_id} failed: {reason}{}", failure_hint(.solution, .escalate))]
    WorkflowFailed {
        workflow_id: String,
        job_id: Option<uuid::Uuid>,
        reason: String,
        /// Known fix from the knowledge base.
        solution: Option<String>,
        /// Consecutive failures reached the escalation threshold.
        escalate: bool,
    },

    #[error("Teaching error: {0}")]
    Teaching(String),

    #[error("Automation error: {0}")]
    Automation(#[from] AutomationError),

    #[error("Capacity exceeded: {what} (max {max})")]
    CapacityExceeded { what: &'static str, max: usize },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(
        entity: &'static str,
        id: impl ToString,
        state: impl ToString,
        action: impl Into<String>,
    ) -> Self {
        Self::StateConflict {
            entity,
            id: id.to_string(),
            state: state.to_string(),
            action: action.into(),
        }
    }

    /// Faults move the owning worker to its Error state.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::ExecutionFault(_))
    }

    /// Structured context kept on a failed task next to the message.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::WorkflowFailed {
                workflow_id,
                job_id,
                solution,
                escalate,
                ..
            } => Some(serde_json::json!({
                "workflow_id": workflow_id,
                "job_id": job_id,
                "known_solution": solution,
                "escalate_to_human": escalate,
            })),
            Self::EscalationRequired { failures, .. } => Some(serde_json::json!({
                "escalate_to_human": true,
                "consecutive_failures": failures,
            })),
            _ => None,
        }
    }
}

fn failure_hint(solution: &Option<String>, escalate: &bool) -> String {
    let mut hint = String::new();
    if let Some(solution) = solution {
        hint.push_str(&format!(" (known fix: {solution})"));
    }
    if *escalate {
        hint.push_str(" [needs human attention]");
    }
    hint
}

/// Errors raised by an automation backend or element resolver.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AutomationError {
    #[error("Failed to launch automation context: {0}")]
    LaunchFailed(String),

    #[error("Navigation to {url} failed: {reason}")]
    NavigationFailed { url: String, reason: String },

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Action {action} failed: {reason}")]
    ActionFailed { action: String, reason: String },

    #[error("Recording error: {0}")]
    Recording(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Automation context is closed")]
    Closed,
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

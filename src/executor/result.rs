//! Execution results and progress events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::automation::ResolutionSource;
use crate::workflows::{SelectorOutcome, StepAction};

/// Outcome of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// The step's 1-based order.
    pub step: u32,
    pub action: StepAction,
    pub success: bool,
    /// Irreversible step resolved but not performed in a dry run.
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<ResolutionSource>,
    /// Neither resolver found the step's element.
    #[serde(default)]
    pub resolution_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub workflow_id: String,
    pub version: u32,
    pub success: bool,
    /// Order of the step that stopped the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at_step: Option<u32>,
    pub cancelled: bool,
    pub dry_run: bool,
    pub total_steps: u32,
    /// Only steps that were attempted, in order.
    pub step_results: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn steps_completed(&self) -> u32 {
        self.step_results.iter().filter(|r| r.success).count() as u32
    }

    /// Per-selector outcomes: primary resolution is a success, fallback
    /// resolution or no resolution a failure.
    pub fn selector_outcomes(&self) -> Vec<SelectorOutcome> {
        self.step_results
            .iter()
            .filter_map(|r| match (r.resolved_by, r.resolution_failed) {
                (Some(source), _) => Some(SelectorOutcome {
                    order: r.step,
                    success: source == ResolutionSource::Primary,
                }),
                (None, true) => Some(SelectorOutcome {
                    order: r.step,
                    success: false,
                }),
                (None, false) => None,
            })
            .collect()
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Progress reported while a workflow runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StepStarted {
        step: u32,
        /// 0-based position in the workflow.
        index: u32,
        total: u32,
        description: String,
    },
    StepFinished {
        result: StepResult,
        index: u32,
        total: u32,
    },
    Paused {
        before_step: u32,
    },
    Resumed {
        step: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(step: u32, resolved_by: Option<ResolutionSource>, resolution_failed: bool) -> StepResult {
        StepResult {
            step,
            action: StepAction::Click,
            success: !resolution_failed,
            skipped: false,
            resolved_by,
            resolution_failed,
            confidence: None,
            duration_ms: 1,
            error: None,
        }
    }

    #[test]
    fn selector_outcomes_follow_resolution_source() {
        let now = Utc::now();
        let result = ExecutionResult {
            workflow_id: "facebook.post_content".into(),
            version: 1,
            success: false,
            failed_at_step: Some(4),
            cancelled: false,
            dry_run: false,
            total_steps: 4,
            step_results: vec![
                step(1, Some(ResolutionSource::Primary), false),
                step(2, None, false),
                step(3, Some(ResolutionSource::Fallback), false),
                step(4, None, true),
            ],
            started_at: now,
            finished_at: now,
            error: None,
        };

        let outcomes = result.selector_outcomes();
        assert_eq!(
            outcomes,
            vec![
                SelectorOutcome { order: 1, success: true },
                SelectorOutcome { order: 3, success: false },
                SelectorOutcome { order: 4, success: false },
            ]
        );
        assert_eq!(result.steps_completed(), 3);
    }
}

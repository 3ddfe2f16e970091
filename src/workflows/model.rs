//! Workflow data model.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::platform::Platform;

/// What a step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Click,
    Type,
    Wait,
    Navigate,
    Upload,
    Scroll,
    Select,
    PressKey,
}

impl StepAction {
    /// Whether the action operates on a located element.
    pub fn needs_element(&self) -> bool {
        matches!(self, Self::Click | Self::Type | Self::Upload | Self::Select)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Type => "type",
            Self::Wait => "wait",
            Self::Navigate => "navigate",
            Self::Upload => "upload",
            Self::Scroll => "scroll",
            Self::Select => "select",
            Self::PressKey => "press_key",
        }
    }
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a selector locates its element, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    /// Stable element identifier (id, test id, aria label).
    Id,
    /// Structural CSS path.
    Css,
    /// Generated XPath expression.
    XPath,
    /// Visible text match.
    Text,
}

impl SelectorKind {
    /// Prior confidence assigned when a selector is learned.
    pub fn prior_confidence(&self) -> f64 {
        match self {
            Self::Id => 0.95,
            Self::Css => 0.80,
            Self::XPath => 0.60,
            Self::Text => 0.40,
        }
    }
}

/// Locator for a UI element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementSelector {
    pub kind: SelectorKind,
    pub value: String,
    /// Estimated reliability in `[0, 1]`.
    pub confidence: f64,
}

impl ElementSelector {
    pub fn new(kind: SelectorKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            confidence: kind.prior_confidence(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

/// One action in a learned workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Position in the workflow, strictly increasing, starting at 1.
    pub order: u32,
    pub action: StepAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<ElementSelector>,
    /// Literal input or a `{{placeholder}}` template. URL for navigation,
    /// key name for key presses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// Delay after the step completes.
    pub wait_after_ms: u64,
    pub description: String,
    /// Skipped (not performed) in dry-run mode, e.g. the final "Post" click.
    #[serde(default)]
    pub irreversible: bool,
}

impl WorkflowStep {
    pub fn new(order: u32, action: StepAction, description: impl Into<String>) -> Self {
        Self {
            order,
            action,
            selector: None,
            input: None,
            wait_after_ms: 0,
            description: description.into(),
            irreversible: false,
        }
    }

    pub fn with_selector(mut self, selector: ElementSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait_after_ms = wait.as_millis() as u64;
        self
    }

    pub fn irreversible(mut self) -> Self {
        self.irreversible = true;
        self
    }

    pub fn wait_after(&self) -> Duration {
        Duration::from_millis(self.wait_after_ms)
    }
}

/// Check the structural invariants of a step list.
pub fn validate_steps(steps: &[WorkflowStep]) -> Result<()> {
    if steps.is_empty() {
        return Err(Error::Validation("workflow has no steps".to_string()));
    }

    let mut previous: Option<u32> = None;
    for step in steps {
        if let Some(prev) = previous
            && step.order <= prev
        {
            return Err(Error::Validation(format!(
                "step orders must be strictly increasing: {} follows {}",
                step.order, prev
            )));
        }
        previous = Some(step.order);

        if step.action.needs_element() && step.selector.is_none() {
            return Err(Error::Validation(format!(
                "step {} ({}) requires an element selector",
                step.order, step.action
            )));
        }

        if let Some(selector) = &step.selector
            && !(0.0..=1.0).contains(&selector.confidence)
        {
            return Err(Error::Validation(format!(
                "step {} selector confidence {} is outside [0, 1]",
                step.order, selector.confidence
            )));
        }

        if step.action == StepAction::Navigate && step.input.is_none() {
            return Err(Error::Validation(format!(
                "step {} navigates without a URL",
                step.order
            )));
        }
    }
    Ok(())
}

/// One immutable version of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedWorkflow {
    pub workflow_id: String,
    pub version: u32,
    pub steps: Vec<WorkflowStep>,
    pub is_human_trained: bool,
    /// Execution-adjusted confidence in `[0, 1]`.
    pub confidence: f64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Teaching session that produced this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_session: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LearnedWorkflow {
    pub fn total_runs(&self) -> u64 {
        self.success_count + self.failure_count
    }

    pub fn success_rate(&self) -> f64 {
        match self.total_runs() {
            0 => 0.0,
            n => self.success_count as f64 / n as f64,
        }
    }
}

/// Input to [`crate::workflows::WorkflowStore::save`].
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub id: String,
    pub platform: Platform,
    pub task_type: String,
    pub steps: Vec<WorkflowStep>,
    pub is_human_trained: bool,
    /// Starting confidence; the mean selector confidence when `None`.
    pub confidence: Option<f64>,
    pub source_session: Option<Uuid>,
}

impl NewWorkflow {
    /// A workflow keyed by its platform and task type.
    pub fn for_task(
        platform: Platform,
        task_type: impl Into<String>,
        steps: Vec<WorkflowStep>,
    ) -> Self {
        let task_type = task_type.into();
        Self {
            id: WorkflowDefinition::id_for(platform, &task_type),
            platform,
            task_type,
            steps,
            is_human_trained: false,
            confidence: None,
            source_session: None,
        }
    }

    pub fn human_trained(mut self, session: Option<Uuid>) -> Self {
        self.is_human_trained = true;
        self.source_session = session;
        self
    }
}

/// All versions of a workflow plus its activation flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub platform: Platform,
    pub task_type: String,
    pub versions: BTreeMap<u32, LearnedWorkflow>,
    /// Always the highest key in `versions`.
    pub current_version: u32,
    /// Inactive definitions accept no new jobs.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Canonical id for a platform/task-type workflow, e.g. `facebook.post_content`.
    pub fn id_for(platform: Platform, task_type: &str) -> String {
        format!("{platform}.{task_type}")
    }

    pub fn current(&self) -> Option<&LearnedWorkflow> {
        self.versions.get(&self.current_version)
    }

    pub fn version(&self, version: u32) -> Option<&LearnedWorkflow> {
        self.versions.get(&version)
    }

    /// Store `workflow` as the next version and advance the pointer.
    pub fn push_version(&mut self, mut workflow: LearnedWorkflow) -> u32 {
        let next = self.versions.keys().next_back().copied().unwrap_or(0) + 1;
        workflow.version = next;
        workflow.workflow_id = self.id.clone();
        self.versions.insert(next, workflow);
        self.current_version = next;
        self.updated_at = Utc::now();
        next
    }
}

//! Task model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::platform::Platform;

/// Kind of work a task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    GenerateContent,
    PostContent,
    DiscoverGroups,
    JoinGroups,
    ReplyComments,
}

impl TaskType {
    pub const ALL: [TaskType; 5] = [
        Self::GenerateContent,
        Self::PostContent,
        Self::DiscoverGroups,
        Self::JoinGroups,
        Self::ReplyComments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenerateContent => "generate_content",
            Self::PostContent => "post_content",
            Self::DiscoverGroups => "discover_groups",
            Self::JoinGroups => "join_groups",
            Self::ReplyComments => "reply_comments",
        }
    }

    /// Whether the task drives a browser workflow.
    pub fn is_automation(&self) -> bool {
        !matches!(self, Self::GenerateContent)
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Knobs shared by browser-workflow payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutomationOptions {
    /// Run this workflow instead of `{platform}.{task_type}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_version: Option<u32>,
    #[serde(default)]
    pub dry_run: bool,
}

/// Task input; the variant must match the task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    GenerateContent {
        prompt: String,
        #[serde(default)]
        topics: Vec<String>,
    },
    PostContent {
        #[serde(default)]
        text: String,
        #[serde(default)]
        hashtags: Vec<String>,
        #[serde(default)]
        media: Vec<String>,
        #[serde(flatten)]
        options: AutomationOptions,
    },
    DiscoverGroups {
        keywords: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
        #[serde(flatten)]
        options: AutomationOptions,
    },
    JoinGroups {
        group_urls: Vec<String>,
        #[serde(flatten)]
        options: AutomationOptions,
    },
    ReplyComments {
        post_url: String,
        reply_text: String,
        #[serde(flatten)]
        options: AutomationOptions,
    },
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::GenerateContent { .. } => TaskType::GenerateContent,
            Self::PostContent { .. } => TaskType::PostContent,
            Self::DiscoverGroups { .. } => TaskType::DiscoverGroups,
            Self::JoinGroups { .. } => TaskType::JoinGroups,
            Self::ReplyComments { .. } => TaskType::ReplyComments,
        }
    }

    pub fn automation_options(&self) -> Option<&AutomationOptions> {
        match self {
            Self::GenerateContent { .. } => None,
            Self::PostContent { options, .. }
            | Self::DiscoverGroups { options, .. }
            | Self::JoinGroups { options, .. }
            | Self::ReplyComments { options, .. } => Some(options),
        }
    }

    /// Content checks for the variant.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| -> Result<()> { Err(Error::Validation(msg.to_string())) };
        match self {
            Self::GenerateContent { prompt, .. } if prompt.trim().is_empty() => {
                invalid("generate_content needs a prompt")
            }
            Self::PostContent { text, media, .. } if text.trim().is_empty() && media.is_empty() => {
                invalid("post_content needs text or media")
            }
            Self::DiscoverGroups { keywords, .. } if keywords.iter().all(|k| k.trim().is_empty()) => {
                invalid("discover_groups needs at least one keyword")
            }
            Self::DiscoverGroups { limit: Some(0), .. } => invalid("discover_groups limit must be positive"),
            Self::JoinGroups { group_urls, .. } if group_urls.iter().all(|u| u.trim().is_empty()) => {
                invalid("join_groups needs at least one group url")
            }
            Self::ReplyComments { post_url, reply_text, .. }
                if post_url.trim().is_empty() || reply_text.trim().is_empty() =>
            {
                invalid("reply_comments needs a post url and reply text")
            }
            _ => Ok(()),
        }
    }
}

/// Scheduling priority; higher runs first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Cancelled) |
            (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A unit of work submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub platform: Platform,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand_id: Option<String>,
    pub payload: TaskPayload,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    /// 0..=100 while running, 100 once completed.
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    pub fn transition_to(&mut self, status: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(status) {
            return Err(Error::conflict("task", self.id, self.status, format!("move to {status}")));
        }
        self.status = status;
        match status {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            TaskStatus::Pending => {}
        }
        Ok(())
    }
}

/// Input to [`crate::tasks::Orchestrator::submit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub task_type: TaskType,
    pub platform: Platform,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand_id: Option<String>,
    pub payload: TaskPayload,
    #[serde(default)]
    pub priority: TaskPriority,
}

impl TaskSubmission {
    pub fn new(platform: Platform, user_id: impl Into<String>, payload: TaskPayload) -> Self {
        Self {
            task_type: payload.task_type(),
            platform,
            user_id: user_id.into(),
            brand_id: None,
            payload,
            priority: TaskPriority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_brand(mut self, brand_id: impl Into<String>) -> Self {
        self.brand_id = Some(brand_id.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(Error::Validation("user id must not be empty".to_string()));
        }
        if self.payload.task_type() != self.task_type {
            return Err(Error::Validation(format!(
                "payload is for {}, task type is {}",
                self.payload.task_type(),
                self.task_type
            )));
        }
        self.payload.validate()
    }
}

/// Filter for [`crate::tasks::Orchestrator::list`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub user_id: Option<String>,
    pub platform: Option<Platform>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self.user_id.as_ref().is_none_or(|u| &task.user_id == u)
            && self.platform.is_none_or(|p| task.platform == p)
    }
}

/// Task lifecycle notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Submitted {
        task_id: Uuid,
        task_type: TaskType,
        platform: Platform,
    },
    Started {
        task_id: Uuid,
        worker_id: Uuid,
    },
    Finished {
        task_id: Uuid,
        status: TaskStatus,
    },
}

//! Teaching session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::automation::RawAction;
use crate::error::{Error, Result};
use crate::platform::Platform;

/// Lifecycle of a teaching session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Context launched, recording not yet running.
    Started,
    /// Capturing user actions.
    Recording,
    /// Learned and saved as a workflow version.
    Completed,
    /// Discarded.
    Cancelled,
    /// The context stopped recording; steps flushed so far are kept.
    Failed,
}

impl SessionStatus {
    pub fn can_transition_to(&self, target: SessionStatus) -> bool {
        use SessionStatus::*;

        matches!(
            (self, target),
            (Started, Recording) | (Started, Cancelled) | (Recording, Completed)
                | (Recording, Cancelled)
                | (Recording, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::Recording => "recording",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One annotated chunk of a demonstration: the actions recorded since the
/// previous flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeachingStep {
    /// 1-based position in the session.
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    pub actions: Vec<RawAction>,
    pub recorded_at: DateTime<Utc>,
}

/// Parameters for [`crate::teaching::TeachingRecorder::start_session`].
#[derive(Debug, Clone)]
pub struct StartSession {
    pub platform: Platform,
    /// Task type the learned workflow will serve, e.g. `post_content`.
    pub workflow_type: String,
    pub start_url: Option<String>,
    pub user_id: String,
}

/// A human demonstration in progress or finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeachingSession {
    pub id: Uuid,
    pub platform: Platform,
    pub workflow_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_url: Option<String>,
    pub user_id: String,
    pub status: SessionStatus,
    pub steps: Vec<TeachingStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Workflow id and version produced on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learned: Option<(String, u32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TeachingSession {
    pub fn new(request: &StartSession) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            platform: request.platform,
            workflow_type: request.workflow_type.clone(),
            start_url: request.start_url.clone(),
            user_id: request.user_id.clone(),
            status: SessionStatus::Started,
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            learned: None,
            error: None,
        }
    }

    pub fn transition_to(&mut self, status: SessionStatus) -> Result<()> {
        if !self.status.can_transition_to(status) {
            return Err(Error::conflict(
                "teaching session",
                self.id,
                self.status,
                format!("move to {status}"),
            ));
        }
        self.status = status;
        self.updated_at = Utc::now();
        if status.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Append a step. Only allowed while recording.
    pub fn push_step(&mut self, instruction: Option<String>, actions: Vec<RawAction>) -> Result<&TeachingStep> {
        if self.status != SessionStatus::Recording {
            return Err(Error::conflict("teaching session", self.id, self.status, "add a step"));
        }
        self.steps.push(TeachingStep {
            index: self.steps.len() as u32 + 1,
            instruction,
            actions,
            recorded_at: Utc::now(),
        });
        self.updated_at = Utc::now();
        Ok(&self.steps[self.steps.len() - 1])
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Every recorded action in order.
    pub fn actions(&self) -> impl Iterator<Item = &RawAction> {
        self.steps.iter().flat_map(|s| s.actions.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::RawActionKind;

    fn session() -> TeachingSession {
        TeachingSession::new(&StartSession {
            platform: Platform::Facebook,
            workflow_type: "post_content".into(),
            start_url: None,
            user_id: "u1".into(),
        })
    }

    #[test]
    fn steps_only_append_while_recording() {
        let mut s = session();
        assert!(s.push_step(None, vec![RawAction::new(RawActionKind::Click)]).is_err());

        s.transition_to(SessionStatus::Recording).unwrap();
        s.push_step(Some("open composer".into()), vec![RawAction::new(RawActionKind::Click)])
            .unwrap();
        s.push_step(None, vec![RawAction::new(RawActionKind::Type)]).unwrap();
        assert_eq!(s.step_count(), 2);
        assert_eq!(s.steps[1].index, 2);

        s.transition_to(SessionStatus::Completed).unwrap();
        assert!(s.completed_at.is_some());
        assert!(s.push_step(None, vec![]).is_err());
    }

    #[test]
    fn terminal_sessions_do_not_move() {
        let mut s = session();
        s.transition_to(SessionStatus::Cancelled).unwrap();
        assert!(s.transition_to(SessionStatus::Recording).is_err());
        assert!(!SessionStatus::Started.can_transition_to(SessionStatus::Completed));
        assert!(SessionStatus::Recording.can_transition_to(SessionStatus::Failed));
        assert!(SessionStatus::Failed.is_terminal());
    }
}

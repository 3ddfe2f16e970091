//! Automation context contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AutomationError;
use crate::platform::Platform;
use crate::workflows::ElementSelector;

/// Opaque reference to a located element, valid within its context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementHandle(pub String);

/// What a recorded user action was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawActionKind {
    Click,
    Type,
    Navigate,
    Upload,
    Scroll,
    Select,
    PressKey,
}

/// Everything the recorder captured about the target element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementFingerprint {
    /// Stable identifier: id attribute, test id or aria label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub css_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xpath: Option<String>,
    /// Visible text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_name: Option<String>,
}

/// One action captured while recording a demonstration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAction {
    pub kind: RawActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ElementFingerprint>,
    /// Typed text, selected option, pressed key or uploaded file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Destination for navigation actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Natural-language annotation supplied by the person demonstrating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<Vec<u8>>,
}

impl RawAction {
    pub fn new(kind: RawActionKind) -> Self {
        Self {
            kind,
            target: None,
            value: None,
            url: None,
            timestamp: Utc::now(),
            instruction: None,
            screenshot: None,
        }
    }

    pub fn with_target(mut self, target: ElementFingerprint) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Current page, as far as a resolver needs it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

/// A live browser session. Owned by exactly one teaching session or execution.
#[async_trait]
pub trait AutomationContext: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), AutomationError>;

    /// Look up an element by selector. `Ok(None)` when nothing matches.
    async fn find_element(
        &mut self,
        selector: &ElementSelector,
    ) -> Result<Option<ElementHandle>, AutomationError>;

    async fn click(&mut self, element: &ElementHandle) -> Result<(), AutomationError>;

    async fn type_text(&mut self, element: &ElementHandle, text: &str) -> Result<(), AutomationError>;

    async fn upload(&mut self, element: &ElementHandle, files: &[String]) -> Result<(), AutomationError>;

    async fn select_option(&mut self, element: &ElementHandle, value: &str) -> Result<(), AutomationError>;

    async fn scroll(&mut self, element: Option<&ElementHandle>) -> Result<(), AutomationError>;

    async fn press_key(&mut self, key: &str) -> Result<(), AutomationError>;

    async fn wait(&mut self, duration: Duration) -> Result<(), AutomationError> {
        tokio::time::sleep(duration).await;
        Ok(())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, AutomationError>;

    async fn page_state(&mut self) -> Result<PageState, AutomationError>;

    /// Begin buffering user actions.
    async fn start_recording(&mut self) -> Result<(), AutomationError>;

    /// Stop buffering and return everything captured since `start_recording`.
    async fn stop_recording(&mut self) -> Result<Vec<RawAction>, AutomationError>;

    async fn close(&mut self) -> Result<(), AutomationError>;
}

/// Creates automation contexts.
#[async_trait]
pub trait AutomationLauncher: Send + Sync {
    async fn launch(&self, platform: Platform) -> Result<Box<dyn AutomationContext>, AutomationError>;
}

//! Turns a recorded demonstration into workflow steps.
//!
//! One raw action becomes one step. Element selectors are chosen by stability
//! (id, short CSS path, XPath, visible text), post-step waits come from the
//! pauses the human made, and typed values are generalized into placeholders
//! using the annotation that came with them.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;

use crate::automation::content::MEDIA_PLACEHOLDER;
use crate::automation::{ElementFingerprint, RawAction, RawActionKind};
use crate::config::TeachingConfig;
use crate::error::{Error, Result};
use crate::teaching::session::TeachingSession;
use crate::workflows::{
    ElementSelector, LearnedWorkflow, NewWorkflow, SelectorKind, StepAction, WorkflowStep,
    WorkflowStore,
};

/// An annotation that *is* a commit: the commit word is the verb (or the clicked
/// label), not a noun inside a longer phrase such as "open post composer".
static COMMIT_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?ix)
        ^\s*
        (?:(?:click|press|tap|hit)\s+(?:on\s+)?(?:the\s+)?)?
        ["']?(?:submit|publish|post|share|send|confirm)["']?
        (?:\s+(?:button|now|it)|\s+(?:to|and|the|your|this|my)\b.*)?
        \s*[.!]?\s*$"#,
    )
    .expect("commit pattern is valid")
});

/// Annotation keywords and the placeholder they stand for. First match wins.
const PLACEHOLDER_KEYWORDS: &[(&[&str], &str)] = &[
    (&["password", "passcode"], "{{password}}"),
    (&["username", "user name", "email", "login"], "{{username}}"),
    (&["hashtag"], "{{hashtags}}"),
    (&["content", "caption", "message", "post text", "status", "comment", "reply"], "{{content}}"),
];

pub struct LearningEngine {
    store: Arc<WorkflowStore>,
    config: TeachingConfig,
}

impl LearningEngine {
    pub fn new(store: Arc<WorkflowStore>, config: TeachingConfig) -> Self {
        Self { store, config }
    }

    /// Steps for the session as it stands, without saving anything.
    pub fn build_steps(&self, session: &TeachingSession) -> Result<Vec<WorkflowStep>> {
        let actions: Vec<&RawAction> = session.actions().collect();
        if actions.is_empty() {
            return Err(Error::Teaching(format!(
                "session {} has no recorded actions",
                session.id
            )));
        }

        let last_click = actions.iter().rposition(|a| a.kind == RawActionKind::Click);
        let mut steps = Vec::with_capacity(actions.len());

        for (i, action) in actions.iter().enumerate() {
            let order = i as u32 + 1;
            let step_action = step_action(action.kind);

            let selector = match &action.target {
                Some(target) => self.choose_selector(target),
                None => None,
            };
            if step_action.needs_element() && selector.is_none() {
                return Err(Error::Teaching(format!(
                    "action {order} ({step_action}) has no usable element target"
                )));
            }

            let mut step = WorkflowStep::new(order, step_action, describe(action, step_action))
                .with_wait(self.wait_after(action, actions.get(i + 1).copied()));
            if let Some(selector) = selector {
                step = step.with_selector(selector);
            }
            if let Some(input) = input_for(action) {
                step = step.with_input(input);
            }

            let annotated_commit = action
                .instruction
                .as_deref()
                .is_some_and(|text| COMMIT_WORDS.is_match(text));
            if action.kind == RawActionKind::Click && (Some(i) == last_click || annotated_commit) {
                step = step.irreversible();
            }

            steps.push(step);
        }

        Ok(steps)
    }

    /// Learn the session and save it as a new human-trained version.
    pub async fn learn(&self, session: &TeachingSession) -> Result<LearnedWorkflow> {
        let steps = self.build_steps(session)?;
        let new = NewWorkflow::for_task(session.platform, &session.workflow_type, steps)
            .human_trained(Some(session.id));
        let learned = self.store.save(new).await?;
        tracing::info!(
            session_id = %session.id,
            workflow_id = %learned.workflow_id,
            version = learned.version,
            steps = learned.steps.len(),
            confidence = learned.confidence,
            "Learned workflow from demonstration"
        );
        Ok(learned)
    }

    /// Most stable selector the fingerprint supports.
    pub fn choose_selector(&self, target: &ElementFingerprint) -> Option<ElementSelector> {
        if let Some(id) = non_empty(&target.element_id) {
            return Some(ElementSelector::new(SelectorKind::Id, id));
        }

        let css = non_empty(&target.css_path);
        if let Some(css) = css
            && css_segments(css) <= self.config.short_path_segments
        {
            return Some(ElementSelector::new(SelectorKind::Css, css));
        }
        if let Some(xpath) = non_empty(&target.xpath) {
            return Some(ElementSelector::new(SelectorKind::XPath, xpath));
        }
        if let Some(text) = non_empty(&target.text) {
            return Some(ElementSelector::new(SelectorKind::Text, text));
        }

        css.map(|css| {
            ElementSelector::new(SelectorKind::Css, css)
                .with_confidence(SelectorKind::XPath.prior_confidence())
        })
    }

    fn wait_after(&self, action: &RawAction, next: Option<&RawAction>) -> Duration {
        let gap = next
            .and_then(|n| (n.timestamp - action.timestamp).to_std().ok())
            .unwrap_or(self.config.min_step_wait);
        gap.clamp(self.config.min_step_wait, self.config.max_step_wait.max(self.config.min_step_wait))
    }
}

fn step_action(kind: RawActionKind) -> StepAction {
    match kind {
        RawActionKind::Click => StepAction::Click,
        RawActionKind::Type => StepAction::Type,
        RawActionKind::Navigate => StepAction::Navigate,
        RawActionKind::Upload => StepAction::Upload,
        RawActionKind::Scroll => StepAction::Scroll,
        RawActionKind::Select => StepAction::Select,
        RawActionKind::PressKey => StepAction::PressKey,
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn css_segments(css: &str) -> usize {
    css.split('>').filter(|s| !s.trim().is_empty()).count()
}

fn placeholder_for(instruction: &str) -> Option<&'static str> {
    let lower = instruction.to_lowercase();
    PLACEHOLDER_KEYWORDS
        .iter()
        .find(|(words, _)| words.iter().any(|w| lower.contains(w)))
        .map(|(_, placeholder)| *placeholder)
}

fn input_for(action: &RawAction) -> Option<String> {
    match action.kind {
        RawActionKind::Navigate => action.url.clone().or_else(|| action.value.clone()),
        RawActionKind::Upload => Some(MEDIA_PLACEHOLDER.to_string()),
        RawActionKind::Type => {
            if let Some(value) = &action.value
                && value.contains("{{")
            {
                return Some(value.clone());
            }
            action
                .instruction
                .as_deref()
                .and_then(placeholder_for)
                .map(String::from)
                .or_else(|| action.value.clone())
        }
        RawActionKind::PressKey => Some(action.value.clone().unwrap_or_else(|| "Enter".to_string())),
        RawActionKind::Select => action.value.clone(),
        RawActionKind::Click | RawActionKind::Scroll => None,
    }
}

fn describe(action: &RawAction, step_action: StepAction) -> String {
    if let Some(instruction) = action.instruction.as_deref().map(str::trim)
        && !instruction.is_empty()
    {
        return instruction.to_string();
    }
    let target = action.target.as_ref().and_then(|t| {
        non_empty(&t.text)
            .map(|s| format!("'{s}'"))
            .or_else(|| non_empty(&t.element_id).map(String::from))
            .or_else(|| non_empty(&t.tag_name).map(String::from))
    });
    match (step_action, target) {
        (StepAction::Navigate, _) => format!("navigate to {}", action.url.as_deref().unwrap_or("page")),
        (a, Some(target)) => format!("{a} {target}"),
        (a, None) => a.to_string(),
    }
}

//! Scripted in-memory automation backend.
//!
//! `FakeBrowser` answers element lookups from a fixed set of
//! `"{kind}:{value}"` keys (`id:submit`, `css:div > a`, `text:Post`) and
//! journals every action it performs. Clones share state, so a test keeps one
//! copy and hands the other to a [`FakeLauncher`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::automation::{
    AutomationContext, AutomationLauncher, ElementHandle, PageState, RawAction,
};
use crate::error::AutomationError;
use crate::platform::Platform;
use crate::workflows::{ElementSelector, SelectorKind};

fn key_for(selector: &ElementSelector) -> String {
    let kind = match selector.kind {
        SelectorKind::Id => "id",
        SelectorKind::Css => "css",
        SelectorKind::XPath => "xpath",
        SelectorKind::Text => "text",
    };
    format!("{kind}:{}", selector.value)
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone, Default)]
pub struct FakeBrowser {
    elements: Arc<Mutex<HashSet<String>>>,
    broken: Arc<Mutex<HashSet<String>>>,
    journal: Arc<Mutex<Vec<String>>>,
    captured: Arc<Mutex<Vec<RawAction>>>,
    recording: Arc<AtomicBool>,
    refuse_recording: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
    lookup_delay: Option<Duration>,
    url: Arc<Mutex<String>>,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_elements<I, S>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.elements).extend(keys.into_iter().map(Into::into));
        self
    }

    /// Elements that are found but fail when acted on.
    pub fn with_broken<I, S>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.broken).extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn with_lookup_delay(mut self, delay: Duration) -> Self {
        self.lookup_delay = Some(delay);
        self
    }

    /// Make later `start_recording` calls fail.
    pub fn refuse_recording(&self, refuse: bool) {
        self.refuse_recording.store(refuse, Ordering::SeqCst);
    }

    pub fn add_element(&self, key: impl Into<String>) {
        lock(&self.elements).insert(key.into());
    }

    pub fn remove_element(&self, key: &str) {
        lock(&self.elements).remove(key);
    }

    /// Simulate the user performing an action while recording.
    pub fn user_action(&self, action: RawAction) {
        if self.recording.load(Ordering::SeqCst) {
            lock(&self.captured).push(action);
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Actions performed so far, e.g. `click:id:submit`.
    pub fn journal(&self) -> Vec<String> {
        lock(&self.journal).clone()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, entry: String) {
        lock(&self.journal).push(entry);
    }

    fn act(&self, action: &str, element: &ElementHandle, detail: Option<&str>) -> Result<(), AutomationError> {
        if lock(&self.broken).contains(&element.0) {
            return Err(AutomationError::ActionFailed {
                action: action.to_string(),
                reason: format!("{} is not interactable", element.0),
            });
        }
        match detail {
            Some(d) => self.record(format!("{action}:{}={d}", element.0)),
            None => self.record(format!("{action}:{}", element.0)),
        }
        Ok(())
    }
}

#[async_trait]
impl AutomationContext for FakeBrowser {
    async fn navigate(&mut self, url: &str) -> Result<(), AutomationError> {
        *lock(&self.url) = url.to_string();
        self.record(format!("navigate:{url}"));
        Ok(())
    }

    async fn find_element(
        &mut self,
        selector: &ElementSelector,
    ) -> Result<Option<ElementHandle>, AutomationError> {
        if let Some(delay) = self.lookup_delay {
            tokio::time::sleep(delay).await;
        }
        let key = key_for(selector);
        Ok(lock(&self.elements).contains(&key).then_some(ElementHandle(key)))
    }

    async fn click(&mut self, element: &ElementHandle) -> Result<(), AutomationError> {
        self.act("click", element, None)
    }

    async fn type_text(&mut self, element: &ElementHandle, text: &str) -> Result<(), AutomationError> {
        self.act("type", element, Some(text))
    }

    async fn upload(&mut self, element: &ElementHandle, files: &[String]) -> Result<(), AutomationError> {
        self.act("upload", element, Some(&files.join(",")))
    }

    async fn select_option(&mut self, element: &ElementHandle, value: &str) -> Result<(), AutomationError> {
        self.act("select", element, Some(value))
    }

    async fn scroll(&mut self, element: Option<&ElementHandle>) -> Result<(), AutomationError> {
        match element {
            Some(e) => self.act("scroll", e, None),
            None => {
                self.record("scroll:page".to_string());
                Ok(())
            }
        }
    }

    async fn press_key(&mut self, key: &str) -> Result<(), AutomationError> {
        self.record(format!("press:{key}"));
        Ok(())
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, AutomationError> {
        let state = if self.is_recording() { "recording" } else { "idle" };
        self.record(format!("screenshot:{state}"));
        Ok(b"\x89PNG".to_vec())
    }

    async fn page_state(&mut self) -> Result<PageState, AutomationError> {
        Ok(PageState {
            url: lock(&self.url).clone(),
            title: None,
            html: None,
        })
    }

    async fn start_recording(&mut self) -> Result<(), AutomationError> {
        if self.refuse_recording.load(Ordering::SeqCst) {
            return Err(AutomationError::Recording("recorder detached".to_string()));
        }
        self.recording.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_recording(&mut self) -> Result<Vec<RawAction>, AutomationError> {
        self.recording.store(false, Ordering::SeqCst);
        Ok(std::mem::take(&mut *lock(&self.captured)))
    }

    async fn close(&mut self) -> Result<(), AutomationError> {
        self.recording.store(false, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out clones of one [`FakeBrowser`].
#[derive(Clone, Default)]
pub struct FakeLauncher {
    browser: FakeBrowser,
    fail: Arc<AtomicBool>,
    launched: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn new(browser: FakeBrowser) -> Self {
        Self {
            browser,
            ..Self::default()
        }
    }

    pub fn browser(&self) -> &FakeBrowser {
        &self.browser
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AutomationLauncher for FakeLauncher {
    async fn launch(&self, platform: Platform) -> Result<Box<dyn AutomationContext>, AutomationError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AutomationError::LaunchFailed(format!("{platform} browser unavailable")));
        }
        self.launched.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.browser.clone()))
    }
}

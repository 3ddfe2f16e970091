//! Execution content and `{{placeholder}}` substitution.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{AutomationError, Error, Result};
use crate::platform::Platform;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*\}\}").expect("placeholder pattern is valid")
});

/// Placeholder that expands to the upload file list.
pub const MEDIA_PLACEHOLDER: &str = "{{media}}";

/// Login credentials for a platform account.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }
}

/// Values substituted into a workflow's step inputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContent {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub hashtags: Vec<String>,
    /// File paths for upload steps.
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(skip)]
    pub credentials: Option<Credentials>,
}

impl ExecutionContent {
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_hashtags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hashtags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_media<I, S>(mut self, media: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.media = media.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Hashtags joined as they would be typed, each prefixed with `#`.
    pub fn hashtag_line(&self) -> String {
        self.hashtags
            .iter()
            .map(|t| {
                let t = t.trim();
                if t.starts_with('#') {
                    t.to_string()
                } else {
                    format!("#{t}")
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "content" | "text" => self.text.clone(),
            "hashtags" => (!self.hashtags.is_empty()).then(|| self.hashtag_line()),
            "username" | "email" => self.credentials.as_ref().map(|c| c.username.clone()),
            "password" => self
                .credentials
                .as_ref()
                .map(|c| c.password.expose_secret().to_string()),
            "media" => (!self.media.is_empty()).then(|| self.media.join(",")),
            other => self.variables.get(other).cloned(),
        }
    }

    /// Substitute every `{{name}}` in `template`. A placeholder without a value
    /// is a validation error.
    pub fn render(&self, template: &str) -> Result<String> {
        let mut missing = Vec::new();
        let rendered = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            self.lookup(name).unwrap_or_else(|| {
                missing.push(name.to_string());
                String::new()
            })
        });

        if !missing.is_empty() {
            return Err(Error::Validation(format!(
                "no value for placeholder(s): {}",
                missing.join(", ")
            )));
        }
        Ok(rendered.into_owned())
    }

    /// Files for an upload step: the media list for `{{media}}`, otherwise the
    /// rendered input split on commas.
    pub fn upload_files(&self, input: &str) -> Result<Vec<String>> {
        if input.trim() == MEDIA_PLACEHOLDER {
            if self.media.is_empty() {
                return Err(Error::Validation("upload step has no media".to_string()));
            }
            return Ok(self.media.clone());
        }
        Ok(self
            .render(input)?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect())
    }
}

/// Names of the placeholders used in `template`.
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Looks up stored account credentials.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    async fn credentials(
        &self,
        user_id: &str,
        platform: Platform,
    ) -> std::result::Result<Option<Credentials>, AutomationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_text_hashtags_and_variables() {
        let content = ExecutionContent::default()
            .with_text("Hello world")
            .with_hashtags(["rust", "#tokio"])
            .with_variable("group", "Rustaceans");

        assert_eq!(
            content.render("{{content}} {{ hashtags }} in {{group}}").unwrap(),
            "Hello world #rust #tokio in Rustaceans"
        );
        assert_eq!(content.render("plain text").unwrap(), "plain text");
    }

    #[test]
    fn missing_placeholder_is_an_error() {
        let content = ExecutionContent::default();
        let err = content.render("{{content}} {{other}}").unwrap_err();
        assert!(err.to_string().contains("content, other"));
    }

    #[test]
    fn credentials_substitute_and_stay_hidden() {
        let content =
            ExecutionContent::default().with_credentials(Credentials::new("alice", "hunter2"));
        assert_eq!(content.render("{{password}}").unwrap(), "hunter2");
        assert_eq!(content.render("{{username}}").unwrap(), "alice");
        assert!(!format!("{content:?}").contains("hunter2"));
    }

    #[test]
    fn upload_uses_media_list() {
        let content = ExecutionContent::default().with_media(["/tmp/a.png", "/tmp/b.png"]);
        assert_eq!(content.upload_files("{{media}}").unwrap().len(), 2);
        assert!(ExecutionContent::default().upload_files("{{media}}").is_err());
    }

    #[test]
    fn lists_placeholders() {
        assert_eq!(placeholders("{{a}} x {{ b }}"), vec!["a", "b"]);
    }
}

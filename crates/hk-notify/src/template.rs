//! Notification templates and rendering.
//!
//! A template is addressed by `(kind, channel, language)` and carries an
//! optional title plus a body with `{placeholder}` slots. Rendering fails on
//! a missing placeholder rather than shipping a hole to the user. Language
//! falls back to the platform default when the requested one is missing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Messenger,
    Email,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Messenger => "messenger",
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub kind: String,
    pub channel: Channel,
    pub language: String,
    pub title: Option<String>,
    pub body: String,
}

/// A rendered, ready-to-send message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub title: Option<String>,
    pub body: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("no template for kind `{kind}` on {channel} ({language})")]
    NotFound {
        kind: String,
        channel: Channel,
        language: String,
    },

    #[error("placeholder `{0}` has no value")]
    MissingPlaceholder(String),

    #[error("unbalanced placeholder braces in template")]
    UnbalancedBraces,
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

pub struct TemplateCatalog {
    templates: HashMap<(String, Channel, String), NotificationTemplate>,
    default_language: String,
}

impl TemplateCatalog {
    pub fn new(default_language: impl Into<String>) -> Self {
        Self {
            templates: HashMap::new(),
            default_language: default_language.into(),
        }
    }

    pub fn insert(&mut self, template: NotificationTemplate) {
        let key = (
            template.kind.clone(),
            template.channel,
            template.language.clone(),
        );
        self.templates.insert(key, template);
    }

    /// Look up a template, falling back to the default language.
    pub fn get(
        &self,
        kind: &str,
        channel: Channel,
        language: &str,
    ) -> Result<&NotificationTemplate, RenderError> {
        let exact = (kind.to_string(), channel, language.to_string());
        if let Some(template) = self.templates.get(&exact) {
            return Ok(template);
        }

        if language != self.default_language {
            let fallback = (kind.to_string(), channel, self.default_language.clone());
            if let Some(template) = self.templates.get(&fallback) {
                return Ok(template);
            }
        }

        Err(RenderError::NotFound {
            kind: kind.to_string(),
            channel,
            language: language.to_string(),
        })
    }

    /// Render a template with the given variables.
    pub fn render(
        &self,
        kind: &str,
        channel: Channel,
        language: &str,
        variables: &HashMap<String, String>,
    ) -> Result<RenderedMessage, RenderError> {
        let template = self.get(kind, channel, language)?;

        let title = template
            .title
            .as_deref()
            .map(|t| substitute(t, variables))
            .transpose()?;
        let body = substitute(&template.body, variables)?;

        Ok(RenderedMessage { title, body })
    }
}

/// Replace `{name}` slots and normalise the escape whitelist.
///
/// Authored templates carry literal `\n`/`\t` sequences; exactly those two
/// become real whitespace at render time. Everything else stays verbatim.
fn substitute(
    template: &str,
    variables: &HashMap<String, String>,
) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => return Err(RenderError::UnbalancedBraces),
                    }
                }
                let value = variables
                    .get(&name)
                    .ok_or_else(|| RenderError::MissingPlaceholder(name.clone()))?;
                out.push_str(value);
            }
            '\\' => match chars.peek() {
                Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('t') => {
                    chars.next();
                    out.push('\t');
                }
                _ => out.push('\\'),
            },
            other => out.push(other),
        }
    }

    Ok(out)
}

// ---------------------------------------------------------------------------
// Platform defaults
// ---------------------------------------------------------------------------

/// The built-in template set the notification service starts with.
pub fn platform_catalog(default_language: &str) -> TemplateCatalog {
    let mut catalog = TemplateCatalog::new(default_language);

    catalog.insert(NotificationTemplate {
        kind: "request_created".into(),
        channel: Channel::Messenger,
        language: "ru".into(),
        title: None,
        body: "Заявка {request_number} принята.\\nКатегория: {category}".into(),
    });
    catalog.insert(NotificationTemplate {
        kind: "request_assigned".into(),
        channel: Channel::Messenger,
        language: "ru".into(),
        title: None,
        body: "Вам назначена заявка {request_number}.\\nАдрес: {address}".into(),
    });
    catalog.insert(NotificationTemplate {
        kind: "request_completed".into(),
        channel: Channel::Messenger,
        language: "ru".into(),
        title: None,
        body: "Заявка {request_number} выполнена.".into(),
    });
    catalog.insert(NotificationTemplate {
        kind: "request_completed".into(),
        channel: Channel::Email,
        language: "ru".into(),
        title: Some("Заявка {request_number}".into()),
        body: "Работы по заявке {request_number} завершены.".into(),
    });

    catalog
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

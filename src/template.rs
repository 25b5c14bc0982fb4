// src/template.rs

//! `%(name)s` command templates.
//!
//! Event handler commands and xtrigger arguments are written with
//! `%(key)s` placeholders. Rendering is strict: a placeholder naming a key
//! outside the supplied set is a [`TemplateError::UnknownKey`], never a
//! silently empty substitution. `%%` renders as a literal `%`.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::shell;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown template key '{key}' in '{template}'")]
    UnknownKey { key: String, template: String },

    #[error("unterminated placeholder in '{template}'")]
    Unterminated { template: String },
}

/// One piece of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Percent,
    Key(&'a str),
}

fn parse(template: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(idx) = rest.find('%') {
        if idx > 0 {
            segments.push(Segment::Literal(&rest[..idx]));
        }
        let after = &rest[idx + 1..];
        if let Some(tail) = after.strip_prefix('%') {
            segments.push(Segment::Percent);
            rest = tail;
        } else if let Some(body) = after.strip_prefix('(') {
            let close = body.find(')').ok_or_else(|| TemplateError::Unterminated {
                template: template.to_string(),
            })?;
            let key = &body[..close];
            let tail = body[close + 1..].strip_prefix('s').ok_or_else(|| {
                TemplateError::Unterminated {
                    template: template.to_string(),
                }
            })?;
            segments.push(Segment::Key(key));
            rest = tail;
        } else {
            segments.push(Segment::Literal("%"));
            rest = after;
        }
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

/// Keys referenced by a template, in order of appearance.
pub fn placeholders(template: &str) -> Result<Vec<String>, TemplateError> {
    Ok(parse(template)?
        .into_iter()
        .filter_map(|s| match s {
            Segment::Key(k) => Some(k.to_string()),
            _ => None,
        })
        .collect())
}

/// True when the template contains at least one `%(key)s` placeholder.
pub fn has_placeholders(template: &str) -> bool {
    placeholders(template).map(|p| !p.is_empty()).unwrap_or(true)
}

/// Render `template`, resolving every placeholder through `lookup`.
pub fn render<F>(template: &str, lookup: F) -> Result<String, TemplateError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    for segment in parse(template)? {
        match segment {
            Segment::Literal(s) => out.push_str(s),
            Segment::Percent => out.push('%'),
            Segment::Key(key) => match lookup(key) {
                Some(value) => out.push_str(&value),
                None => {
                    return Err(TemplateError::UnknownKey {
                        key: key.to_string(),
                        template: template.to_string(),
                    });
                }
            },
        }
    }
    Ok(out)
}

/// The fixed set of variables available to event handler templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventVar {
    Event,
    Workflow,
    Uuid,
    Point,
    SubmitNum,
    TryNum,
    Id,
    Message,
    JobRunnerName,
    JobId,
    SubmitTime,
    StartTime,
    FinishTime,
    PlatformName,
    Name,
}

impl EventVar {
    pub const ALL: [EventVar; 15] = [
        EventVar::Event,
        EventVar::Workflow,
        EventVar::Uuid,
        EventVar::Point,
        EventVar::SubmitNum,
        EventVar::TryNum,
        EventVar::Id,
        EventVar::Message,
        EventVar::JobRunnerName,
        EventVar::JobId,
        EventVar::SubmitTime,
        EventVar::StartTime,
        EventVar::FinishTime,
        EventVar::PlatformName,
        EventVar::Name,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventVar::Event => "event",
            EventVar::Workflow => "workflow",
            EventVar::Uuid => "uuid",
            EventVar::Point => "point",
            EventVar::SubmitNum => "submit_num",
            EventVar::TryNum => "try_num",
            EventVar::Id => "id",
            EventVar::Message => "message",
            EventVar::JobRunnerName => "job_runner_name",
            EventVar::JobId => "job_id",
            EventVar::SubmitTime => "submit_time",
            EventVar::StartTime => "start_time",
            EventVar::FinishTime => "finish_time",
            EventVar::PlatformName => "platform_name",
            EventVar::Name => "name",
        }
    }

    /// Deprecated key names still accepted in handler templates.
    fn aliases(self) -> &'static [&'static str] {
        match self {
            EventVar::Workflow => &["suite"],
            EventVar::Uuid => &["suite_uuid"],
            EventVar::JobRunnerName => &["batch_sys_name"],
            EventVar::JobId => &["batch_sys_job_id"],
            EventVar::PlatformName => &["user@host"],
            _ => &[],
        }
    }

    /// Numeric values are substituted bare; everything else is shell-quoted.
    fn is_numeric(self) -> bool {
        matches!(self, EventVar::SubmitNum | EventVar::TryNum)
    }
}

/// Resolved substitution values for one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventTemplateVars {
    values: BTreeMap<String, String>,
}

impl EventTemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable (and its deprecated aliases).
    pub fn set(&mut self, var: EventVar, value: impl AsRef<str>) -> &mut Self {
        let rendered = if var.is_numeric() {
            value.as_ref().to_string()
        } else {
            shell::quote(value.as_ref())
        };
        for alias in var.aliases() {
            self.values.insert((*alias).to_string(), rendered.clone());
        }
        self.values.insert(var.as_str().to_string(), rendered);
        self
    }

    /// Task metadata keys become template keys (`%(title)s`, `%(URL)s`).
    pub fn set_task_meta(&mut self, meta: &BTreeMap<String, String>) -> &mut Self {
        for (key, value) in meta {
            if key == "URL" {
                self.values.insert("task_url".to_string(), shell::quote(value));
            }
            self.values
                .entry(key.clone())
                .or_insert_with(|| shell::quote(value));
        }
        self
    }

    /// Workflow metadata keys are available as `%(workflow_<key>)s`.
    pub fn set_workflow_meta(&mut self, meta: &BTreeMap<String, String>) -> &mut Self {
        for (key, value) in meta {
            if key == "URL" {
                self.values.insert("workflow_url".to_string(), shell::quote(value));
            }
            self.values
                .insert(format!("workflow_{key}"), shell::quote(value));
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn render(&self, template: &str) -> Result<String, TemplateError> {
        render(template, |key| self.values.get(key).cloned())
    }
}

/// Positional form used for handler commands without placeholders:
/// `<handler> '<event>' '<workflow>' '<id>' '<message>'`.
pub fn legacy_handler_command(
    handler: &str,
    event: &str,
    workflow: &str,
    id: &str,
    message: &str,
) -> String {
    format!(
        "{handler} '{}' '{}' '{}' '{}'",
        escape_single(event),
        escape_single(workflow),
        escape_single(id),
        escape_single(message)
    )
}

fn escape_single(s: &str) -> String {
    s.replace('\'', "'\\''")
}

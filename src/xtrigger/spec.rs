// src/xtrigger/spec.rs

//! Xtrigger function declarations: `func(arg, k=v):interval`.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::config::duration::parse_duration;
use crate::template::{self, TemplateError};

/// Seconds between calls when the declaration gives no interval.
pub const DEFAULT_INTERVAL: f64 = 10.0;

pub const WALL_CLOCK: &str = "wall_clock";

/// Keys usable as `%(key)s` in xtrigger arguments.
pub const ARG_TEMPLATE_KEYS: [&str; 8] = [
    "point",
    "id",
    "name",
    "workflow",
    "user_name",
    "workflow_run_dir",
    "workflow_share_dir",
    "debug",
];

/// A declared (possibly still templated) xtrigger call.
#[derive(Debug, Clone, PartialEq)]
pub struct XtriggerSpec {
    pub func_name: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    /// Seconds between calls.
    pub interval: f64,
}

impl XtriggerSpec {
    pub fn new(func_name: impl Into<String>) -> Self {
        Self {
            func_name: func_name.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn interval(mut self, secs: f64) -> Self {
        self.interval = secs;
        self
    }

    /// Parse `func(a, "b", k=1):30s`.
    pub fn parse(decl: &str) -> Result<Self, String> {
        let decl = decl.trim();
        let open = decl
            .find('(')
            .ok_or_else(|| format!("'{decl}': expected func(args)"))?;
        let close = decl
            .rfind(')')
            .filter(|&c| c > open)
            .ok_or_else(|| format!("'{decl}': unbalanced parentheses"))?;

        let func_name = decl[..open].trim();
        if func_name.is_empty()
            || !func_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(format!("'{decl}': invalid function name '{func_name}'"));
        }

        let mut spec = XtriggerSpec::new(func_name);
        for part in split_args(&decl[open + 1..close]) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match split_kwarg(part) {
                Some((key, value)) => {
                    spec.kwargs.insert(key.to_string(), parse_value(value));
                }
                None => spec.args.push(parse_value(part)),
            }
        }

        let tail = decl[close + 1..].trim();
        if let Some(interval) = tail.strip_prefix(':') {
            spec.interval = parse_duration(interval)
                .map_err(|e| format!("'{decl}': bad interval: {e}"))?;
        } else if !tail.is_empty() {
            return Err(format!("'{decl}': unexpected trailing '{tail}'"));
        }
        Ok(spec)
    }

    pub fn is_wall_clock(&self) -> bool {
        self.func_name == WALL_CLOCK
    }

    /// `func(a, b, k1=v1, k2=v2)` with keyword arguments sorted.
    pub fn signature(&self) -> String {
        let mut parts: Vec<String> = self.args.iter().map(value_str).collect();
        parts.extend(
            self.kwargs
                .iter()
                .map(|(k, v)| format!("{k}={}", value_str(v))),
        );
        format!("{}({})", self.func_name, parts.join(", "))
    }

    /// Every `%(key)s` used in string arguments.
    pub fn template_keys(&self) -> Result<Vec<String>, TemplateError> {
        let mut keys = Vec::new();
        for v in self.args.iter().chain(self.kwargs.values()) {
            if let Value::String(s) = v {
                keys.extend(template::placeholders(s)?);
            }
        }
        Ok(keys)
    }

    /// Copy with string arguments rendered through `lookup`.
    pub fn render<F>(&self, lookup: F) -> Result<XtriggerSpec, TemplateError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let render_value = |v: &Value| -> Result<Value, TemplateError> {
            match v {
                Value::String(s) => Ok(Value::String(template::render(s, &lookup)?)),
                other => Ok(other.clone()),
            }
        };
        Ok(XtriggerSpec {
            func_name: self.func_name.clone(),
            args: self
                .args
                .iter()
                .map(render_value)
                .collect::<Result<_, _>>()?,
            kwargs: self
                .kwargs
                .iter()
                .map(|(k, v)| Ok((k.clone(), render_value(v)?)))
                .collect::<Result<_, TemplateError>>()?,
            interval: self.interval,
        })
    }
}

impl fmt::Display for XtriggerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.signature(), self.interval)
    }
}

fn value_str(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn split_args(inner: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&inner[start..]);
    parts
}

fn split_kwarg(part: &str) -> Option<(&str, &str)> {
    let (key, value) = part.split_once('=')?;
    let key = key.trim();
    let is_ident = !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    is_ident.then(|| (key, value.trim()))
}

fn parse_value(raw: &str) -> Value {
    let raw = raw.trim();
    for q in ['\'', '"'] {
        if raw.len() >= 2 && raw.starts_with(q) && raw.ends_with(q) {
            return Value::String(raw[1..raw.len() - 1].to_string());
        }
    }
    match raw {
        "true" | "True" => return Value::Bool(true),
        "false" | "False" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_args_kwargs_and_interval() {
        let spec = XtriggerSpec::parse("check(a, 'b c', z=3, point=%(point)s):30s").unwrap();
        assert_eq!(spec.func_name, "check");
        assert_eq!(spec.args, vec![Value::from("a"), Value::from("b c")]);
        assert_eq!(spec.kwargs["z"], Value::from(3));
        assert_eq!(spec.interval, 30.0);
        assert_eq!(spec.signature(), "check(a, b c, point=%(point)s, z=3)");
        assert_eq!(spec.template_keys().unwrap(), vec!["point"]);
    }

    #[test]
    fn default_interval_and_empty_args() {
        let spec = XtriggerSpec::parse("wall_clock()").unwrap();
        assert!(spec.is_wall_clock());
        assert_eq!(spec.interval, DEFAULT_INTERVAL);
        assert_eq!(spec.signature(), "wall_clock()");
        assert_eq!(spec.to_string(), "wall_clock():10");
    }

    #[test]
    fn rejects_malformed() {
        assert!(XtriggerSpec::parse("nofunc").is_err());
        assert!(XtriggerSpec::parse("bad name()").is_err());
        assert!(XtriggerSpec::parse("f(x) trailing").is_err());
        assert!(XtriggerSpec::parse("f(x):never").is_err());
    }

    #[test]
    fn render_substitutes_string_args_only() {
        let spec = XtriggerSpec::new("f")
            .arg("%(point)s")
            .kwarg("n", 2)
            .kwarg("who", "%(name)s");
        let out = spec
            .render(|k| match k {
                "point" => Some("20260101T0000Z".to_string()),
                "name" => Some("foo".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(out.signature(), "f(20260101T0000Z, n=2, who=foo)");
        assert!(spec.render(|_| None).is_err());
    }
}

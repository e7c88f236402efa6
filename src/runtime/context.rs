/// Run context and template resolution
///
/// The context maps `trigger` and each completed step's output alias to its value.
/// Steps see an immutable snapshot; adding an output produces a new context that
/// shares every existing value with the old one.

use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use crate::error::StepError;

/// Reserved key holding errors recorded by `continueOnError` steps
pub const ERRORS_KEY: &str = "$errors";

/// Reserved key holding the trigger payload
pub const TRIGGER_KEY: &str = "trigger";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder pattern is valid"));

/// Copy-on-write snapshot of values available to step templates
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    values: Arc<BTreeMap<String, Arc<Value>>>,
}

impl RunContext {
    /// Context seeded with the trigger payload
    pub fn new(trigger_payload: Value) -> Self {
        let mut values = BTreeMap::new();
        values.insert(TRIGGER_KEY.to_string(), Arc::new(trigger_payload));
        Self { values: Arc::new(values) }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).map(|v| v.as_ref())
    }

    /// New snapshot with `alias` bound to `value`
    pub fn with_value(&self, alias: &str, value: Value) -> Self {
        let mut values = (*self.values).clone();
        values.insert(alias.to_string(), Arc::new(value));
        Self { values: Arc::new(values) }
    }

    /// New snapshot recording a tolerated step failure: the alias becomes null and the
    /// error is kept under `$errors.<alias>`
    pub fn with_error(&self, alias: &str, step_id: &str, error: &StepError) -> Self {
        let mut errors = match self.get(ERRORS_KEY) {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        errors.insert(
            alias.to_string(),
            json!({ "stepId": step_id, "kind": error.kind, "message": error.message }),
        );

        let mut values = (*self.values).clone();
        values.insert(alias.to_string(), Arc::new(Value::Null));
        values.insert(ERRORS_KEY.to_string(), Arc::new(Value::Object(errors)));
        Self { values: Arc::new(values) }
    }

    /// Value at a dot-separated path; numeric segments index arrays
    pub fn resolve_path(&self, path: &str) -> Option<Value> {
        let mut segments = path.trim().split('.');
        let root = self.get(segments.next()?)?;
        let mut current = root;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }

    /// Whole context as a JSON object, optionally without reserved keys
    pub fn to_value(&self, include_reserved: bool) -> Value {
        let map: Map<String, Value> = self
            .values
            .iter()
            .filter(|(key, _)| include_reserved || (key.as_str() != TRIGGER_KEY && !key.starts_with('$')))
            .map(|(key, value)| (key.clone(), (**value).clone()))
            .collect();
        Value::Object(map)
    }
}

/// Resolve every `{{path}}` leaf of a template against the context
///
/// A string that is exactly one placeholder becomes the referenced value (null when
/// unresolvable). Placeholders embedded in longer strings are interpolated as text.
pub fn resolve_template(template: &Value, context: &RunContext) -> Value {
    match template {
        Value::String(text) => resolve_string(text, context),
        Value::Array(items) => Value::Array(items.iter().map(|item| resolve_template(item, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), resolve_template(value, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(text: &str, context: &RunContext) -> Value {
    let trimmed = text.trim();
    if let Some(captures) = PLACEHOLDER.captures(trimmed) {
        if captures.get(0).map(|m| m.as_str().len()) == Some(trimmed.len()) {
            return context.resolve_path(&captures[1]).unwrap_or(Value::Null);
        }
    } else {
        return Value::String(text.to_string());
    }

    let interpolated = PLACEHOLDER.replace_all(text, |captures: &regex::Captures| {
        match context.resolve_path(&captures[1]) {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    });
    Value::String(interpolated.into_owned())
}

/// Run output: the resolved `returnValue`, or the context without reserved keys
pub fn resolve_return_value(return_value: Option<&str>, context: &RunContext) -> Value {
    match return_value {
        Some(expr) if expr.contains("{{") => resolve_string(expr, context),
        Some(path) => context.resolve_path(path).unwrap_or(Value::Null),
        None => context.to_value(false),
    }
}

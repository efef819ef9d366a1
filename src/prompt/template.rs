//! `{{ variable }}` templating of instructions against the task input.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

fn variable_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)((?:\.[A-Za-z0-9_]+)*)\s*\}\}")
            .expect("variable regex is valid")
    })
}

/// Top-level input fields referenced by the template.
pub fn referenced_variables(template: &str) -> BTreeSet<String> {
    variable_regex()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Render the template. Strings are inserted as-is, other values as compact JSON and
/// missing values as the empty string.
pub fn render(template: &str, input: &Value) -> String {
    variable_regex()
        .replace_all(template, |caps: &Captures| {
            let mut value = input.get(&caps[1]);
            for segment in caps[2].split('.').filter(|s| !s.is_empty()) {
                value = value.and_then(|v| match v {
                    Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                    other => other.get(segment),
                });
            }
            match value {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            }
        })
        .into_owned()
}

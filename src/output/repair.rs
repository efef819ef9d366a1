//! Tolerant JSON extraction from model text.
//!
//! Models wrap JSON in prose or code fences, put raw newlines inside strings, double
//! encode the whole object, or (when streaming) stop in the middle of it. This module
//! gets the outermost JSON object out of all of those.

use serde_json::Value;

/// Number of truncation attempts when closing a partial object.
const MAX_PARTIAL_CUTS: usize = 64;

/// Extract the outermost JSON object from `text`.
///
/// With `partial`, unterminated strings, arrays and objects are closed so that an
/// incomplete stream prefix still yields the fields received so far.
pub fn parse_json_object(text: &str, partial: bool) -> Result<Value, String> {
    parse_inner(text, partial, 0)
}

fn parse_inner(text: &str, partial: bool, depth: usize) -> Result<Value, String> {
    let trimmed = strip_code_fence(text.trim());

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        match value {
            Value::Object(_) => return Ok(value),
            Value::String(inner) if depth == 0 => return parse_inner(&inner, partial, depth + 1),
            _ => {}
        }
    }

    let start = trimmed
        .find('{')
        .ok_or_else(|| "No JSON object found in output".to_string())?;
    let rest = &trimmed[start..];

    // {\"a\": 1} written without the outer quotes
    if rest.starts_with("{\\\"") && depth == 0 {
        let quoted = format!("\"{}\"", rest.trim_end());
        if let Ok(Value::String(inner)) = serde_json::from_str::<Value>(&quoted) {
            return parse_inner(&inner, partial, depth + 1);
        }
    }

    let candidate = match find_object_end(rest) {
        Some(end) => &rest[..end],
        None => rest,
    };

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(candidate) {
        return Ok(value);
    }

    let repaired = repair(candidate);
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&repaired) {
        return Ok(value);
    }

    if partial {
        return close_partial(&repaired);
    }

    serde_json::from_str::<Value>(&repaired)
        .map_err(|e| format!("Invalid JSON in output: {}", e))
        .and_then(|_| Err("Output is not a JSON object".to_string()))
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the language tag line
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Byte offset just past the `}` matching the first `{`, if the object is complete.
fn find_object_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Fix the common deviations: control characters inside strings, literal `\n`
/// sequences between tokens and trailing commas.
fn repair(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => {}
                c => out.push(c),
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '\\' => {
                // A backslash is never valid between tokens: `\n`, `\t`, `\r` are stray
                // escape sequences standing for whitespace.
                if matches!(chars.peek(), Some('n') | Some('t') | Some('r')) {
                    chars.next();
                }
                out.push(' ');
            }
            '}' | ']' => {
                let trimmed_len = out.trim_end().len();
                if out[..trimmed_len].ends_with(',') {
                    out.truncate(trimmed_len - 1);
                }
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

/// Close unterminated strings and containers of a JSON prefix.
fn close(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut out = text.to_string();
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(',') {
        out.pop();
    } else if out.ends_with(':') {
        out.push_str("null");
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Position of the last comma outside strings.
fn last_comma(text: &str) -> Option<usize> {
    let mut in_string = false;
    let mut escaped = false;
    let mut last = None;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            ',' => last = Some(i),
            _ => {}
        }
    }
    last
}

/// Close a partial object, dropping trailing tokens until the result parses.
fn close_partial(text: &str) -> Result<Value, String> {
    let mut candidate = text.to_string();
    for _ in 0..MAX_PARTIAL_CUTS {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&close(&candidate)) {
            return Ok(value);
        }
        match last_comma(&candidate) {
            Some(pos) => candidate.truncate(pos),
            None => break,
        }
    }
    Ok(Value::Object(Default::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_object() {
        assert_eq!(parse_json_object(r#"{"a": 1}"#, false).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_prose_and_fences_are_stripped() {
        let text = "Sure! Here it is:\n```json\n{\"answer\": \"42\"}\n```\nHope that helps.";
        assert_eq!(parse_json_object(text, false).unwrap(), json!({"answer": "42"}));
        let fenced = "```json\n{\"answer\": \"42\"}\n```";
        assert_eq!(parse_json_object(fenced, false).unwrap(), json!({"answer": "42"}));
    }

    #[test]
    fn test_raw_newlines_in_strings() {
        let text = "{\"text\": \"line one\nline two\"}";
        assert_eq!(
            parse_json_object(text, false).unwrap(),
            json!({"text": "line one\nline two"})
        );
    }

    #[test]
    fn test_stray_literal_newlines_between_tokens() {
        let text = r#"{\n  "a": 1,\n  "b": "x\ny"\n}"#;
        assert_eq!(parse_json_object(text, false).unwrap(), json!({"a": 1, "b": "x\ny"}));
    }

    #[test]
    fn test_double_encoded() {
        let text = r#""{\"a\": {\"b\": [1, 2]}}""#;
        assert_eq!(parse_json_object(text, false).unwrap(), json!({"a": {"b": [1, 2]}}));
        let unquoted = r#"{\"a\": 1}"#;
        assert_eq!(parse_json_object(unquoted, false).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_trailing_commas() {
        assert_eq!(
            parse_json_object(r#"{"a": [1, 2,], "b": 3,}"#, false).unwrap(),
            json!({"a": [1, 2], "b": 3})
        );
    }

    #[test]
    fn test_unrecoverable() {
        assert!(parse_json_object("no json here", false).is_err());
        assert!(parse_json_object(r#"{"a": "#, false).is_err());
    }

    #[test]
    fn test_partial_prefixes() {
        assert_eq!(parse_json_object(r#"{"a": "hel"#, true).unwrap(), json!({"a": "hel"}));
        assert_eq!(parse_json_object(r#"{"a": 1, "b"#, true).unwrap(), json!({"a": 1}));
        assert_eq!(parse_json_object(r#"{"a": 1, "b":"#, true).unwrap(), json!({"a": 1, "b": null}));
        assert_eq!(
            parse_json_object(r#"{"a": {"c": [1, 2"#, true).unwrap(),
            json!({"a": {"c": [1, 2]}})
        );
        assert_eq!(parse_json_object(r#"{"a": tr"#, true).unwrap(), json!({}));
        assert_eq!(parse_json_object("{", true).unwrap(), json!({}));
    }
}

//! JSON Schema helpers for prompt rendering.

use std::collections::BTreeSet;

use serde_json::{json, Map, Value};

use crate::llm::{File, FileWithKeyPath, KeyPathSegment, ToolDefinition};
use crate::output::{AGENT_RUN_RESULT_KEY, REASONING_STEPS_KEY, TOOL_CALLS_KEY};

/// Definition names that denote a file in task schemas.
const FILE_DEFINITIONS: &[&str] = &["File", "Image", "Audio", "PDF", "TextFile"];
const FILE_FORMATS: &[&str] = &["file", "image", "audio", "pdf"];

/// Nesting limit when walking schemas, guards against recursive `$ref`s.
const MAX_DEPTH: usize = 32;

/// Follow a local `$ref` (`#/$defs/..` or `#/definitions/..`).
pub fn resolve_ref<'a>(root: &'a Value, node: &'a Value) -> &'a Value {
    let mut current = node;
    for _ in 0..MAX_DEPTH {
        let Some(target) = current
            .get("$ref")
            .and_then(Value::as_str)
            .and_then(|r| r.strip_prefix('#'))
            .and_then(|pointer| root.pointer(pointer))
        else {
            break;
        };
        current = target;
    }
    current
}

pub fn is_file_schema(node: &Value) -> bool {
    if let Some(name) = node
        .get("$ref")
        .and_then(Value::as_str)
        .and_then(|r| r.rsplit('/').next())
    {
        if FILE_DEFINITIONS.contains(&name) {
            return true;
        }
    }
    node.get("format")
        .and_then(Value::as_str)
        .map_or(false, |f| FILE_FORMATS.contains(&f))
}

pub fn is_file_array_schema(root: &Value, node: &Value) -> bool {
    let node = resolve_ref(root, node);
    node.get("type").and_then(Value::as_str) == Some("array")
        && node.get("items").map_or(false, is_file_schema)
}

/// Name of the only property of the schema, if there is exactly one.
pub fn single_property(schema: &Value) -> Option<(&String, &Value)> {
    let properties = schema.get("properties")?.as_object()?;
    if properties.len() != 1 {
        return None;
    }
    properties.iter().next()
}

/// Remove `names` from the schema's `properties` and `required`.
pub fn remove_properties(schema: &Value, names: &BTreeSet<String>) -> Value {
    let mut schema = schema.clone();
    if names.is_empty() {
        return schema;
    }
    if let Some(properties) = schema.get_mut("properties").and_then(Value::as_object_mut) {
        properties.retain(|k, _| !names.contains(k));
    }
    if let Some(required) = schema.get_mut("required").and_then(Value::as_array_mut) {
        required.retain(|v| v.as_str().map_or(true, |k| !names.contains(k)));
    }
    schema
}

/// Remove `names` from the top level of the input object.
pub fn remove_input_fields(input: &Value, names: &BTreeSet<String>) -> Value {
    match input {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !names.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Files in `input`, located by walking the input together with its schema.
pub fn collect_files(schema: &Value, input: &Value) -> Vec<FileWithKeyPath> {
    let mut out = Vec::new();
    let mut path = Vec::new();
    walk(schema, schema, input, &mut path, &mut out, 0);
    out
}

fn walk(
    root: &Value,
    node: &Value,
    value: &Value,
    path: &mut Vec<KeyPathSegment>,
    out: &mut Vec<FileWithKeyPath>,
    depth: usize,
) {
    if depth > MAX_DEPTH || value.is_null() {
        return;
    }
    if is_file_schema(node) {
        if let Some(file) = File::from_value(value) {
            out.push(FileWithKeyPath {
                file,
                key_path: path.clone(),
            });
        }
        return;
    }

    let node = resolve_ref(root, node);

    // Optional or union fields: the first variant that yields files wins
    for combinator in ["anyOf", "oneOf"] {
        if let Some(variants) = node.get(combinator).and_then(Value::as_array) {
            for variant in variants {
                let before = out.len();
                walk(root, variant, value, path, out, depth + 1);
                if out.len() > before {
                    return;
                }
            }
        }
    }

    match value {
        Value::Object(map) => {
            let Some(properties) = node.get("properties").and_then(Value::as_object) else {
                return;
            };
            for (key, item) in map {
                if let Some(child) = properties.get(key) {
                    path.push(KeyPathSegment::Key(key.clone()));
                    walk(root, child, item, path, out, depth + 1);
                    path.pop();
                }
            }
        }
        Value::Array(items) => {
            let Some(child) = node.get("items") else {
                return;
            };
            for (index, item) in items.iter().enumerate() {
                path.push(KeyPathSegment::Index(index));
                walk(root, child, item, path, out, depth + 1);
                path.pop();
            }
        }
        _ => {}
    }
}

/// Replace the schema of the property at `path` with a plain string. Only paths made of
/// object keys are rewritten.
pub fn replace_with_string_schema(schema: &mut Value, path: &[KeyPathSegment]) {
    let mut node = schema;
    for segment in path {
        let KeyPathSegment::Key(key) = segment else {
            return;
        };
        match node.get_mut("properties").and_then(|p| p.get_mut(key)) {
            Some(child) => node = child,
            None => return,
        }
    }
    let description = node.get("description").cloned();
    let mut replacement = json!({"type": "string"});
    if let Some(description) = description {
        replacement["description"] = description;
    }
    *node = replacement;
}

/// Which reserved fields to add to an output schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservedFields {
    pub reasoning_steps: bool,
    pub agent_run_result: bool,
    pub tool_calls: bool,
}

/// Output schema extended with the reserved fields the model may fill.
pub fn with_reserved_fields(output_schema: &Value, reserved: ReservedFields) -> Value {
    let mut schema = output_schema.clone();
    if reserved == ReservedFields::default() {
        return schema;
    }
    let Value::Object(object) = &mut schema else {
        return schema;
    };
    let properties = object
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(properties) = properties else {
        return schema;
    };

    if reserved.reasoning_steps {
        properties.insert(
            REASONING_STEPS_KEY.to_string(),
            json!({
                "type": "array",
                "description": "Step by step reasoning leading to the answer",
                "items": {
                    "type": "object",
                    "properties": {
                        "title": {"type": "string"},
                        "explanation": {"type": "string"}
                    }
                }
            }),
        );
    }
    if reserved.tool_calls {
        properties.insert(
            TOOL_CALLS_KEY.to_string(),
            json!({
                "type": "array",
                "description": "Tools to call before answering. Leave empty to answer",
                "items": {
                    "type": "object",
                    "properties": {
                        "tool_name": {"type": "string"},
                        "tool_input_dict": {"type": "object"}
                    },
                    "required": ["tool_name", "tool_input_dict"]
                }
            }),
        );
    }
    if reserved.agent_run_result {
        properties.insert(
            AGENT_RUN_RESULT_KEY.to_string(),
            json!({
                "type": "object",
                "description": "Whether the task could be completed",
                "properties": {
                    "status": {"type": "string", "enum": ["success", "failure"]},
                    "error_code": {"type": "string"},
                    "error_message": {"type": "string"}
                },
                "required": ["status"]
            }),
        );
    }
    schema
}

/// Tool listing for models that call tools through the output.
pub fn describe_tools(tools: &[ToolDefinition]) -> String {
    tools
        .iter()
        .map(|t| format!("- {}: {}\n  Input schema: {}", t.name, t.description, t.parameters))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_with_files() -> Value {
        json!({
            "type": "object",
            "$defs": {"Image": {"type": "object", "properties": {"url": {"type": "string"}}}},
            "properties": {
                "photo": {"$ref": "#/$defs/Image"},
                "attachments": {"type": "array", "items": {"$ref": "#/$defs/File"}},
                "nested": {"type": "object", "properties": {
                    "doc": {"anyOf": [{"$ref": "#/$defs/File"}, {"type": "null"}]}
                }},
                "name": {"type": "string"}
            },
            "required": ["photo", "name"]
        })
    }

    #[test]
    fn test_collect_files_with_key_paths() {
        let input = json!({
            "photo": {"url": "https://x.com/cat.png"},
            "attachments": [{"url": "https://x.com/a.pdf"}, {"data": "aGk=", "content_type": "text/plain"}],
            "nested": {"doc": {"url": "https://x.com/b.mp3"}},
            "name": "cat"
        });
        let files = collect_files(&schema_with_files(), &input);
        let pointers: Vec<String> = files.iter().map(|f| f.pointer()).collect();
        assert_eq!(
            pointers,
            vec!["/attachments/0", "/attachments/1", "/nested/doc", "/photo"]
        );
    }

    #[test]
    fn test_remove_properties() {
        let names = BTreeSet::from(["name".to_string()]);
        let schema = remove_properties(&schema_with_files(), &names);
        assert!(schema["properties"].get("name").is_none());
        assert_eq!(schema["required"], json!(["photo"]));
    }

    #[test]
    fn test_single_file_detection() {
        let root = json!({
            "type": "object",
            "properties": {"files": {"type": "array", "items": {"$ref": "#/$defs/File"}}}
        });
        let (_, prop) = single_property(&root).unwrap();
        assert!(is_file_array_schema(&root, prop));
        assert!(!is_file_schema(prop));
    }

    #[test]
    fn test_reserved_fields_are_added() {
        let out = json!({"type": "object", "properties": {"answer": {"type": "string"}}});
        let augmented = with_reserved_fields(
            &out,
            ReservedFields {
                reasoning_steps: true,
                agent_run_result: true,
                tool_calls: false,
            },
        );
        let keys: Vec<&String> = augmented["properties"].as_object().unwrap().keys().collect();
        assert!(keys.contains(&&REASONING_STEPS_KEY.to_string()));
        assert!(keys.contains(&&AGENT_RUN_RESULT_KEY.to_string()));
        assert!(!keys.contains(&&TOOL_CALLS_KEY.to_string()));
        assert_eq!(with_reserved_fields(&out, ReservedFields::default()), out);
    }

    #[test]
    fn test_replace_with_string_schema() {
        let mut schema = json!({"properties": {"doc": {"$ref": "#/$defs/TextFile", "description": "d"}}});
        replace_with_string_schema(&mut schema, &[KeyPathSegment::Key("doc".into())]);
        assert_eq!(schema["properties"]["doc"], json!({"type": "string", "description": "d"}));
    }
}

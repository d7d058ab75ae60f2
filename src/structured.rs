//! Structured output: schema prompting and JSON extraction from free text.

use serde_json::{json, Map, Value};

/// Appended to the last user turn when a response schema is set.
pub const JSON_REMINDER: &str =
    "Respond with only the JSON value described in the system instructions.";

/// System-prompt section describing the expected JSON shape.
pub fn schema_instructions(schema: &Value) -> String {
    let pretty = |v: &Value| serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string());
    format!(
        "Your response must be a single JSON value that conforms to this JSON schema:\n{}\n\n\
         Example of the expected shape:\n{}\n\n\
         Output the JSON only, with no surrounding prose or code fences.",
        pretty(schema),
        pretty(&example_from_schema(schema)),
    )
}

/// Build a placeholder value that satisfies the shape of `schema`.
pub fn example_from_schema(schema: &Value) -> Value {
    if let Some(example) = schema.get("examples").and_then(|e| e.get(0)) {
        return example.clone();
    }
    for key in ["const", "default"] {
        if let Some(v) = schema.get(key) {
            return v.clone();
        }
    }
    if let Some(first) = schema.get("enum").and_then(|e| e.get(0)) {
        return first.clone();
    }
    if let Some(first) = ["oneOf", "anyOf", "allOf"]
        .iter()
        .find_map(|k| schema.get(*k).and_then(|v| v.get(0)))
    {
        return example_from_schema(first);
    }

    match schema_type(schema) {
        Some("object") => {
            let mut out = Map::new();
            if let Some(props) = schema.get("properties").and_then(Value::as_object) {
                for (name, prop) in props {
                    out.insert(name.clone(), example_from_schema(prop));
                }
            }
            Value::Object(out)
        }
        Some("array") => match schema.get("items") {
            Some(items) => json!([example_from_schema(items)]),
            None => json!([]),
        },
        Some("string") => Value::String(string_example(schema)),
        Some("integer") => json!(0),
        Some("number") => json!(0.0),
        Some("boolean") => json!(true),
        Some("null") => Value::Null,
        _ if schema.get("properties").is_some() => {
            example_from_schema(&with_type(schema, "object"))
        }
        _ => Value::Null,
    }
}

/// `type` may be a string or a list; a list yields its first non-null entry.
fn schema_type(schema: &Value) -> Option<&str> {
    match schema.get("type")? {
        Value::String(t) => Some(t),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null")
            .or(Some("null")),
        _ => None,
    }
}

fn with_type(schema: &Value, kind: &str) -> Value {
    let mut schema = schema.clone();
    if let Some(obj) = schema.as_object_mut() {
        obj.insert("type".into(), Value::String(kind.into()));
    }
    schema
}

fn string_example(schema: &Value) -> String {
    match schema.get("format").and_then(Value::as_str) {
        Some("date-time") => "2024-01-01T00:00:00Z".into(),
        Some("date") => "2024-01-01".into(),
        Some("email") => "user@example.com".into(),
        Some("uri") | Some("url") => "https://example.com".into(),
        _ => "string".into(),
    }
}

/// Pull the first complete JSON object or array out of model text.
///
/// Fenced code blocks are searched first. Braces inside string literals
/// (including escaped quotes) do not count toward nesting. Returns `None`
/// when no candidate parses.
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(found) = fenced_blocks(text).find_map(first_balanced) {
        return Some(found);
    }
    first_balanced(text)
}

fn fenced_blocks(text: &str) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        let open = rest.find("```")?;
        let after = &rest[open + 3..];
        // Skip an info string such as `json`.
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        let close = body.find("```")?;
        rest = &body[close + 3..];
        Some(&body[..close])
    })
}

fn first_balanced(text: &str) -> Option<&str> {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find(['{', '[']) {
        let start = search_from + offset;
        if let Some(end) = balanced_end(&text[start..]) {
            let candidate = &text[start..start + end];
            if serde_json::from_str::<Value>(candidate).is_ok() {
                return Some(candidate);
            }
        }
        search_from = start + 1;
    }
    None
}

/// Byte length of the balanced value starting at `text[0]`.
fn balanced_end(text: &str) -> Option<usize> {
    let mut stack = Vec::new();
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
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(c) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

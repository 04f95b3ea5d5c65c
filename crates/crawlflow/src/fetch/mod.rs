pub mod client;

pub use client::{request_url, FetchClient, RequestSpec};

use serde_json::Value;

/// Resolves `path` inside `value`: empty for the whole value, a JSON
/// pointer when it starts with `/`, else a top-level field name.
pub fn lookup<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        Some(value)
    } else if path.starts_with('/') {
        value.pointer(path)
    } else {
        value.get(path)
    }
}

/// Renders scalars as keys: strings verbatim, numbers and booleans via JSON.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

//! Canonical JSON encoding.
//!
//! Object keys are sorted bytewise at every nesting level and the output is
//! compact with no trailing newline, so equal documents always serialize to
//! equal bytes regardless of field declaration order or map implementation.

use quarry_common::QuarryResult;
use serde::Serialize;
use serde_json::{Map, Value};

/// Serialize `value` to canonical JSON bytes.
///
/// # Errors
///
/// Returns an error if `value` cannot be represented as JSON.
pub fn to_canonical_vec<T: Serialize + ?Sized>(value: &T) -> QuarryResult<Vec<u8>> {
    let value = sort_keys(serde_json::to_value(value)?);
    Ok(serde_json::to_vec(&value)?)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, sort_keys(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

//! Partial-update helpers for nested JSON documents.
//!
//! Editable documents are treated as immutable values: `apply_patch` returns a
//! new document with one path replaced, and `merge` folds a partial document
//! (as sent by `PUT` endpoints) into a stored one.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("patch path must not be empty")]
    EmptyPath,
    #[error("cannot descend into {found} at `{path}`")]
    NotAContainer { path: String, found: &'static str },
    #[error("array index `{segment}` out of bounds at `{path}`")]
    IndexOutOfBounds { path: String, segment: String },
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Returns a copy of `doc` with the value at `path` replaced by `value`.
/// Missing object keys along the way are created; arrays are addressed by
/// index and may be appended to with an index equal to their length.
pub fn apply_patch(doc: &Value, path: &[&str], value: Value) -> Result<Value, PatchError> {
    if path.is_empty() {
        return Err(PatchError::EmptyPath);
    }
    let mut next = doc.clone();
    set_at(&mut next, path, value, 0)?;
    Ok(next)
}

fn set_at(node: &mut Value, path: &[&str], value: Value, depth: usize) -> Result<(), PatchError> {
    let segment = path[depth];
    let last = depth + 1 == path.len();
    let parent = || path[..depth].join(".");

    if node.is_null() {
        *node = Value::Object(Map::new());
    }

    match node {
        Value::Object(map) => {
            let slot = map.entry(segment.to_string()).or_insert(Value::Null);
            if last {
                *slot = value;
                Ok(())
            } else {
                set_at(slot, path, value, depth + 1)
            }
        }
        Value::Array(items) => {
            let index = segment
                .parse::<usize>()
                .map_err(|_| PatchError::NotAContainer {
                    path: parent(),
                    found: "an array (non-numeric segment)",
                })?;
            if index > items.len() {
                return Err(PatchError::IndexOutOfBounds {
                    path: parent(),
                    segment: segment.to_string(),
                });
            }
            if index == items.len() {
                items.push(Value::Null);
            }
            if last {
                items[index] = value;
                Ok(())
            } else {
                set_at(&mut items[index], path, value, depth + 1)
            }
        }
        other => Err(PatchError::NotAContainer {
            path: parent(),
            found: kind_of(other),
        }),
    }
}

/// JSON merge-patch: objects merge key by key, `null` removes a key, and any
/// other value (arrays included) replaces the target outright.
pub fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge(
                    target_map.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}

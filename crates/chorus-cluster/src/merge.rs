//! JSON merge patch (RFC 7386) generation
//!
//! [`merge_diff`] is the inverse of `json_patch::merge`: applying its result
//! to `existing` yields `desired`. An empty object means nothing changed.

use serde_json::{Map, Value};

/// Merge patch turning `existing` into `desired`
pub fn merge_diff(existing: &Value, desired: &Value) -> Value {
    match (existing, desired) {
        (Value::Object(old), Value::Object(new)) => Value::Object(object_diff(old, new)),
        _ if existing == desired => Value::Object(Map::new()),
        _ => desired.clone(),
    }
}

fn object_diff(old: &Map<String, Value>, new: &Map<String, Value>) -> Map<String, Value> {
    let mut patch = Map::new();

    for (key, new_value) in new {
        match old.get(key) {
            Some(old_value) if old_value == new_value => {}
            Some(Value::Object(old_obj)) => match new_value {
                Value::Object(new_obj) => {
                    let nested = object_diff(old_obj, new_obj);
                    if !nested.is_empty() {
                        patch.insert(key.clone(), Value::Object(nested));
                    }
                }
                _ => {
                    patch.insert(key.clone(), new_value.clone());
                }
            },
            _ => {
                patch.insert(key.clone(), new_value.clone());
            }
        }
    }

    for key in old.keys() {
        if !new.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }

    patch
}

/// Whether a merge patch changes nothing
pub fn is_empty_patch(patch: &Value) -> bool {
    matches!(patch, Value::Object(map) if map.is_empty())
}

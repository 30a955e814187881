//! Recursive new-only JSON diff.
//!
//! The delivery engine sends clients the subset of the new quotes map
//! that differs from the previous snapshot. The diff is new-only: keys
//! present in the old value but absent from the new one are not emitted,
//! and readers treat missing keys as unchanged.

use serde_json::{Map, Number, Value};

/// Diff `new` against `old`.
///
/// Rules:
/// - Differing types at a position yield the new value.
/// - Objects recurse; a key is emitted only when its nested diff is
///   non-empty.
/// - Arrays compare by serialized equality and are replaced wholesale.
/// - Numbers compare as doubles if either side is a double, as signed
///   integers otherwise.
/// - Null versus null is equal.
pub fn json_diff(old: &Value, new: &Value) -> Value {
    let (Value::Object(old_map), Value::Object(new_map)) = (old, new) else {
        return new.clone();
    };

    let mut diff = Map::new();
    for (key, new_field) in new_map {
        let Some(old_field) = old_map.get(key) else {
            diff.insert(key.clone(), new_field.clone());
            continue;
        };

        if !same_type(old_field, new_field) {
            diff.insert(key.clone(), new_field.clone());
            continue;
        }

        match new_field {
            Value::Object(_) => {
                let nested = json_diff(old_field, new_field);
                if nested.as_object().is_some_and(|m| !m.is_empty()) {
                    diff.insert(key.clone(), nested);
                }
            }
            Value::Array(_) => {
                if old_field.to_string() != new_field.to_string() {
                    diff.insert(key.clone(), new_field.clone());
                }
            }
            Value::Null => {}
            Value::Number(new_number) => {
                let Value::Number(old_number) = old_field else {
                    unreachable!("type equality checked above");
                };
                if !numbers_equal(old_number, new_number) {
                    diff.insert(key.clone(), new_field.clone());
                }
            }
            _ => {
                if old_field != new_field {
                    diff.insert(key.clone(), new_field.clone());
                }
            }
        }
    }

    Value::Object(diff)
}

fn same_type(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Null, Value::Null)
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Array(_), Value::Array(_))
            | (Value::Object(_), Value::Object(_))
    )
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if a.is_f64() || b.is_f64() {
        a.as_f64() == b.as_f64()
    } else if a.is_i64() || b.is_i64() {
        a.as_i64() == b.as_i64()
    } else {
        a.as_u64() == b.as_u64()
    }
}

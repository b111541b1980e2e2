//! Deep merge of configuration documents
//!
//! `merge(base, other)` folds `other` into `base`:
//! - mappings merge key by key, recursing into keys present in both
//! - when both sides are sequences the base sequence is kept as is
//! - any other pair keeps `base` unless it is null
//!
//! Keys already in `base` keep their position; keys only in `other` are
//! appended in `other`'s order.

use serde_yaml::Value;

/// Merge `other` into `base` and return the result.
pub fn merge(base: Value, other: Value) -> Value {
    match (base, other) {
        (Value::Mapping(mut base), Value::Mapping(other)) => {
            for (key, value) in other {
                match base.get_mut(&key) {
                    Some(existing) => {
                        let current = std::mem::replace(existing, Value::Null);
                        *existing = merge(current, value);
                    }
                    None => {
                        base.insert(key, value);
                    }
                }
            }
            Value::Mapping(base)
        }
        (base @ Value::Sequence(_), Value::Sequence(_)) => base,
        (Value::Null, other) => other,
        (base, _) => base,
    }
}

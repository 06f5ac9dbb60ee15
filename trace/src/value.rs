//! Helpers for working with JSON values during rule evaluation.
//!
//! Tool arguments and tool outputs are arbitrary JSON; comparisons must be
//! tolerant of int/float mixing, and strings that hold serialized JSON are
//! only decoded when a rule actually dereferences into them.

use std::cmp::Ordering;

use serde_json::{Number, Value};

/// Numeric value of a JSON number as `f64`.
pub fn num_f64(n: &Number) -> f64 {
    if let Some(i) = n.as_i64() {
        i as f64
    } else if let Some(u) = n.as_u64() {
        u as f64
    } else {
        n.as_f64().unwrap_or(f64::NAN)
    }
}

/// Structural equality with int/float-tolerant number comparison.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(i), Some(j)) = (x.as_i64(), y.as_i64()) {
                i == j
            } else {
                num_f64(x) == num_f64(y)
            }
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(u, v)| values_equal(u, v))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, u)| y.get(k).is_some_and(|v| values_equal(u, v)))
        }
        _ => a == b,
    }
}

/// Ordering between two values; defined for number pairs and string pairs.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => num_f64(x).partial_cmp(&num_f64(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Truthiness of a value when used as a rule filter, Python-style: `null`,
/// `false`, `0`, and empty strings/collections are false.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => num_f64(n) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Decodes a string that holds embedded JSON, if it does.
///
/// Only objects and arrays count: a bare `"42"` stays a string so that
/// ordinary text content is never silently re-typed.
pub fn decode_embedded_json(v: &Value) -> Option<Value> {
    let s = v.as_str()?;
    let trimmed = s.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    serde_json::from_str::<Value>(s)
        .ok()
        .filter(|parsed| parsed.is_object() || parsed.is_array())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_equality_tolerates_int_float_mix() {
        assert!(values_equal(&json!(2), &json!(2.0)));
        assert!(values_equal(&json!(2.5), &json!(2.5)));
        assert!(!values_equal(&json!(2), &json!(3)));
    }

    #[test]
    fn test_compare_values() {
        assert_eq!(compare_values(&json!(1), &json!(2.0)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("a"), &json!("b")), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("a"), &json!(1)), None);
    }

    #[test]
    fn test_truthy() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!(1)));
    }

    #[test]
    fn test_decode_embedded_json() {
        assert_eq!(
            decode_embedded_json(&json!("{\"a\": 1}")),
            Some(json!({"a": 1}))
        );
        assert_eq!(decode_embedded_json(&json!("plain text")), None);
        assert_eq!(decode_embedded_json(&json!("42")), None);
        assert_eq!(decode_embedded_json(&json!(42)), None);
    }
}

/// Result Comparator - Structural Deep Equality
///
/// **Equality Rules:**
/// - NaN equals NaN (`compare(x, x)` holds for every value)
/// - +0 equals -0
/// - Mapping key order is irrelevant
/// - `undefined` and `null` are distinct
/// - Opaque values (functions, symbols) compare by name/description
///
/// Values are walked directly, never serialized and compared as text.

use codelab_common::value::ScriptValue;
use std::collections::BTreeMap;

pub fn compare(actual: &ScriptValue, expected: &ScriptValue) -> bool {
    first_mismatch(actual, expected).is_none()
}

/// Path of the first difference, e.g. `$[1].name`, or None when equal
pub fn first_mismatch(actual: &ScriptValue, expected: &ScriptValue) -> Option<String> {
    mismatch_at(actual, expected, "$".to_string())
}

fn numbers_equal(a: f64, b: f64) -> bool {
    (a.is_nan() && b.is_nan()) || a == b
}

fn mismatch_at(actual: &ScriptValue, expected: &ScriptValue, path: String) -> Option<String> {
    match (actual, expected) {
        (ScriptValue::Undefined, ScriptValue::Undefined)
        | (ScriptValue::Null, ScriptValue::Null)
        | (ScriptValue::Circular, ScriptValue::Circular)
        | (ScriptValue::Truncated, ScriptValue::Truncated) => None,
        (ScriptValue::Bool(a), ScriptValue::Bool(b)) if a == b => None,
        (ScriptValue::Number(a), ScriptValue::Number(b)) if numbers_equal(*a, *b) => None,
        (ScriptValue::BigInt(a), ScriptValue::BigInt(b)) if a == b => None,
        (ScriptValue::String(a), ScriptValue::String(b)) if a == b => None,
        (ScriptValue::Function(a), ScriptValue::Function(b)) if a == b => None,
        (ScriptValue::Symbol(a), ScriptValue::Symbol(b)) if a == b => None,
        (ScriptValue::Array(a), ScriptValue::Array(b)) => array_mismatch(a, b, path),
        (ScriptValue::Object(a), ScriptValue::Object(b)) => object_mismatch(a, b, path),
        _ => Some(path),
    }
}

fn array_mismatch(actual: &[ScriptValue], expected: &[ScriptValue], path: String) -> Option<String> {
    for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
        if let Some(found) = mismatch_at(a, e, format!("{}[{}]", path, idx)) {
            return Some(found);
        }
    }
    if actual.len() != expected.len() {
        // Point at the first element only one side has
        let idx = actual.len().min(expected.len());
        return Some(format!("{}[{}]", path, idx));
    }
    None
}

fn object_mismatch(
    actual: &BTreeMap<String, ScriptValue>,
    expected: &BTreeMap<String, ScriptValue>,
    path: String,
) -> Option<String> {
    // BTreeMap keys iterate sorted, so the walk is independent of insertion order
    for (key, e) in expected {
        let child = child_path(&path, key);
        match actual.get(key) {
            Some(a) => {
                if let Some(found) = mismatch_at(a, e, child) {
                    return Some(found);
                }
            }
            None => return Some(child),
        }
    }
    actual
        .keys()
        .find(|key| !expected.contains_key(*key))
        .map(|key| child_path(&path, key))
}

fn child_path(parent: &str, key: &str) -> String {
    let plain = key.chars().next().map_or(false, |c| c.is_ascii_alphabetic() || c == '_' || c == '$')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if plain {
        format!("{}.{}", parent, key)
    } else {
        format!("{}[{:?}]", parent, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reflexive_including_nan() {
        let values = vec![
            ScriptValue::Number(f64::NAN),
            ScriptValue::Undefined,
            ScriptValue::array([ScriptValue::Number(f64::NAN), ScriptValue::Null]),
            ScriptValue::object([("x", ScriptValue::Number(-0.0))]),
        ];
        for value in &values {
            assert!(compare(value, value), "{} should equal itself", value);
        }
    }

    #[test]
    fn test_signed_zero() {
        assert!(compare(&ScriptValue::Number(0.0), &ScriptValue::Number(-0.0)));
    }

    #[test]
    fn test_key_order_irrelevant() {
        let a: ScriptValue = serde_json::from_str(r#"{"a": 1, "b": {"c": [1, 2], "d": null}}"#).unwrap();
        let b: ScriptValue = serde_json::from_str(r#"{"b": {"d": null, "c": [1, 2]}, "a": 1}"#).unwrap();
        assert!(compare(&a, &b));
    }

    #[test]
    fn test_undefined_is_not_null() {
        assert!(!compare(&ScriptValue::Undefined, &ScriptValue::Null));
    }

    #[test]
    fn test_number_is_not_string() {
        assert!(!compare(&ScriptValue::from(1), &ScriptValue::from("1")));
    }

    #[test]
    fn test_mismatch_paths() {
        let actual: ScriptValue = serde_json::from_str(r#"[{"name": "a"}, {"name": "b"}]"#).unwrap();
        let expected: ScriptValue = serde_json::from_str(r#"[{"name": "a"}, {"name": "c"}]"#).unwrap();
        assert_eq!(first_mismatch(&actual, &expected).as_deref(), Some("$[1].name"));

        let short = ScriptValue::array([1]);
        let long = ScriptValue::array([1, 2]);
        assert_eq!(first_mismatch(&short, &long).as_deref(), Some("$[1]"));

        let extra = ScriptValue::object([("ok", ScriptValue::from(true)), ("my key", ScriptValue::Null)]);
        let base = ScriptValue::object([("ok", ScriptValue::from(true))]);
        assert_eq!(first_mismatch(&extra, &base).as_deref(), Some(r#"$["my key"]"#));
    }
}

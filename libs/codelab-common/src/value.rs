//! Value model shared by the sandbox, the comparator and the UI surface.
//!
//! Values cross two boundaries:
//! - host <-> interpreter, through the tagged wire encoding in the sandbox
//!   crate (full fidelity: `NaN`, `-0`, `undefined`, cycles)
//! - host <-> UI, as plain JSON (lossy for non-finite numbers and `undefined`)
//!
//! Authored JSON (test expectations, arguments) may spell the values plain JSON
//! lacks with single-key escape objects: `{"$num": "NaN"}` (also `"Infinity"`,
//! `"-Infinity"`, `"-0"`), `{"$undefined": true}` and `{"$bigint": "123"}`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Largest integer a double represents exactly (2^53).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// A value produced by, or handed to, a snippet.
///
/// Mapping keys are kept in a `BTreeMap`, so iteration order is deterministic
/// and never reflects insertion order.
#[derive(Debug, Clone)]
pub enum ScriptValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    /// Arbitrary precision integer, decimal text
    BigInt(String),
    String(String),
    Array(Vec<ScriptValue>),
    Object(BTreeMap<String, ScriptValue>),
    /// Opaque callable, carries the function name (may be empty)
    Function(String),
    /// Opaque symbol, carries the description
    Symbol(String),
    /// Back-reference to a value already being encoded
    Circular,
    /// Nesting deeper than the encoder's depth limit
    Truncated,
}

impl ScriptValue {
    pub fn array<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ScriptValue>,
    {
        ScriptValue::Array(items.into_iter().map(Into::into).collect())
    }

    pub fn object<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, ScriptValue)>,
        K: Into<String>,
    {
        ScriptValue::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Short type label used in mismatch messages
    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Undefined => "undefined",
            ScriptValue::Null => "null",
            ScriptValue::Bool(_) => "boolean",
            ScriptValue::Number(_) => "number",
            ScriptValue::BigInt(_) => "bigint",
            ScriptValue::String(_) => "string",
            ScriptValue::Array(_) => "array",
            ScriptValue::Object(_) => "object",
            ScriptValue::Function(_) => "function",
            ScriptValue::Symbol(_) => "symbol",
            ScriptValue::Circular => "circular",
            ScriptValue::Truncated => "truncated",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Render the way a console prints a top-level argument: strings unquoted,
    /// everything else in inspect form.
    pub fn to_console_string(&self) -> String {
        match self {
            ScriptValue::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Convert to plain JSON, the same shape `Serialize` produces
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ScriptValue::Undefined | ScriptValue::Null => serde_json::Value::Null,
            ScriptValue::Bool(b) => serde_json::Value::Bool(*b),
            ScriptValue::Number(n) => json_number(*n),
            ScriptValue::BigInt(digits) => serde_json::Value::String(digits.clone()),
            ScriptValue::String(s) => serde_json::Value::String(s.clone()),
            ScriptValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(ScriptValue::to_json).collect())
            }
            ScriptValue::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            opaque => serde_json::Value::String(opaque.to_string()),
        }
    }
}

fn json_number(n: f64) -> serde_json::Value {
    if !n.is_finite() {
        return serde_json::Value::Null;
    }
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        // -0 collapses to 0 here, JSON has no signed zero
        return serde_json::Value::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

/// Format a number the way script engines print it
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let text = if n > 0.0 { "Infinity" } else { "-Infinity" };
        text.to_string()
    } else if n == 0.0 {
        let text = if n.is_sign_negative() { "-0" } else { "0" };
        text.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i128)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Undefined => write!(f, "undefined"),
            ScriptValue::Null => write!(f, "null"),
            ScriptValue::Bool(b) => write!(f, "{}", b),
            ScriptValue::Number(n) => write!(f, "{}", format_number(*n)),
            ScriptValue::BigInt(digits) => write!(f, "{}n", digits),
            ScriptValue::String(s) => write!(f, "{:?}", s),
            ScriptValue::Array(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            ScriptValue::Object(map) if map.is_empty() => write!(f, "{{}}"),
            ScriptValue::Object(map) => {
                write!(f, "{{ ")?;
                for (idx, (key, value)) in map.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, " }}")
            }
            ScriptValue::Function(name) if name.is_empty() => write!(f, "[Function (anonymous)]"),
            ScriptValue::Function(name) => write!(f, "[Function: {}]", name),
            ScriptValue::Symbol(description) => write!(f, "Symbol({})", description),
            ScriptValue::Circular => write!(f, "[Circular]"),
            ScriptValue::Truncated => write!(f, "[...]"),
        }
    }
}

/// Numbers that only exist as names in authored JSON
pub fn special_number(name: &str) -> Option<f64> {
    match name {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        "-0" => Some(-0.0),
        _ => None,
    }
}

fn is_bigint_literal(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Escape object to value; anything else stays an ordinary object
fn unescape(map: &serde_json::Map<String, serde_json::Value>) -> Option<ScriptValue> {
    if map.len() != 1 {
        return None;
    }
    let (key, value) = map.iter().next()?;
    match (key.as_str(), value) {
        ("$num", serde_json::Value::String(name)) => special_number(name).map(ScriptValue::Number),
        ("$undefined", serde_json::Value::Bool(true)) => Some(ScriptValue::Undefined),
        ("$bigint", serde_json::Value::String(digits)) if is_bigint_literal(digits) => {
            Some(ScriptValue::BigInt(digits.clone()))
        }
        _ => None,
    }
}

impl From<serde_json::Value> for ScriptValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ScriptValue::Null,
            serde_json::Value::Bool(b) => ScriptValue::Bool(b),
            serde_json::Value::Number(n) => ScriptValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => ScriptValue::String(s),
            serde_json::Value::Array(items) => {
                ScriptValue::Array(items.into_iter().map(ScriptValue::from).collect())
            }
            serde_json::Value::Object(map) => match unescape(&map) {
                Some(value) => value,
                None => ScriptValue::Object(
                    map.into_iter().map(|(k, v)| (k, ScriptValue::from(v))).collect(),
                ),
            },
        }
    }
}

impl From<f64> for ScriptValue {
    fn from(n: f64) -> Self {
        ScriptValue::Number(n)
    }
}

impl From<i32> for ScriptValue {
    fn from(n: i32) -> Self {
        ScriptValue::Number(f64::from(n))
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Bool(b)
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::String(s.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::String(s)
    }
}

impl From<Vec<ScriptValue>> for ScriptValue {
    fn from(items: Vec<ScriptValue>) -> Self {
        ScriptValue::Array(items)
    }
}

impl Serialize for ScriptValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ScriptValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(ScriptValue::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(2.0), "2");
        assert_eq!(format_number(-0.0), "-0");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn test_display_nested() {
        let value = ScriptValue::object([
            ("b", ScriptValue::array([1, 2])),
            ("a", ScriptValue::from("x")),
        ]);
        assert_eq!(value.to_string(), r#"{ a: "x", b: [1, 2] }"#);
        assert_eq!(ScriptValue::from("plain").to_console_string(), "plain");
        assert_eq!(ScriptValue::Function("add".into()).to_string(), "[Function: add]");
    }

    #[test]
    fn test_plain_json_serialization() {
        let value = ScriptValue::array([
            ScriptValue::Number(2.0),
            ScriptValue::Number(f64::NAN),
            ScriptValue::Undefined,
            ScriptValue::Number(1.5),
        ]);
        assert_eq!(serde_json::to_value(&value).unwrap(), json!([2, null, null, 1.5]));
    }

    #[test]
    fn test_deserialize_authored_json() {
        let value: ScriptValue = serde_json::from_value(json!({"even": [2, 4], "ok": true})).unwrap();
        match value {
            ScriptValue::Object(map) => {
                assert!(matches!(map.get("ok"), Some(ScriptValue::Bool(true))));
                assert!(matches!(map.get("even"), Some(ScriptValue::Array(items)) if items.len() == 2));
            }
            other => panic!("expected object, got {:?}", other),
        }
    }

    #[test]
    fn test_deserialize_escape_forms() {
        let value: ScriptValue = serde_json::from_value(json!([
            {"$num": "NaN"},
            {"$num": "-Infinity"},
            {"$num": "-0"},
            {"$undefined": true},
            {"$bigint": "-12345678901234567890"},
        ]))
        .unwrap();
        let items = match value {
            ScriptValue::Array(items) => items,
            other => panic!("expected array, got {:?}", other),
        };
        assert!(items[0].as_f64().unwrap().is_nan());
        assert_eq!(items[1].as_f64(), Some(f64::NEG_INFINITY));
        let zero = items[2].as_f64().unwrap();
        assert!(zero == 0.0 && zero.is_sign_negative());
        assert!(matches!(items[3], ScriptValue::Undefined));
        assert!(matches!(&items[4], ScriptValue::BigInt(digits) if digits == "-12345678901234567890"));
    }

    #[test]
    fn test_near_miss_escapes_stay_objects() {
        let value: ScriptValue = serde_json::from_value(json!([
            {"$num": "nan"},
            {"$num": "NaN", "extra": 1},
            {"$undefined": false},
            {"$bigint": "12a"},
        ]))
        .unwrap();
        match value {
            ScriptValue::Array(items) => {
                assert!(items.iter().all(|item| matches!(item, ScriptValue::Object(_))));
            }
            other => panic!("expected array, got {:?}", other),
        }
    }
}

//! Payload maps and wire-safe conversion helpers.
//!
//! Payloads are open JSON objects. Producers put arbitrary values into them, so every
//! conversion here degrades instead of failing: a value that cannot be serialized is
//! replaced by its `Debug` rendering and a warning is logged.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt::Debug;
use tracing::warn;

/// Type-specific fields of an event (model, tokens, cost, tool name, ...)
pub type Payload = Map<String, Value>;

/// Convert a value into a JSON value, falling back to its `Debug` string.
pub fn serialize_field<T: Serialize + Debug + ?Sized>(key: &str, value: &T) -> Value {
    match serde_json::to_value(value) {
        Ok(v) => v,
        Err(e) => {
            warn!("Payload field '{}' is not serializable ({}), using string fallback", key, e);
            Value::String(format!("{:?}", value))
        }
    }
}

/// Insert a value under `key`, using the string fallback when serialization fails.
pub fn insert_serialized<T: Serialize + Debug + ?Sized>(payload: &mut Payload, key: &str, value: &T) {
    payload.insert(key.to_string(), serialize_field(key, value));
}

/// Convert a serializable record into a payload map.
///
/// Objects become the map itself; any other JSON shape is stored under `"value"`.
pub fn to_payload<T: Serialize + Debug + ?Sized>(record: &T) -> Payload {
    match serialize_field("value", record) {
        Value::Object(map) => map,
        other => {
            let mut payload = Payload::new();
            payload.insert("value".to_string(), other);
            payload
        }
    }
}

/// Result of reading a numeric payload field.
#[derive(Debug, Clone, PartialEq)]
pub enum NumericField {
    Missing,
    Value(f64),
    /// Present but not usable as a number; carries the raw JSON text
    Malformed(String),
}

impl NumericField {
    /// The number, treating missing and malformed fields as zero.
    pub fn or_zero(&self) -> f64 {
        match self {
            NumericField::Value(v) => *v,
            _ => 0.0,
        }
    }
}

/// Read `key` as a finite number. Numeric strings are accepted.
pub fn numeric_field(payload: &Payload, key: &str) -> NumericField {
    match payload.get(key) {
        None | Some(Value::Null) => NumericField::Missing,
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v.is_finite() => NumericField::Value(v),
            _ => NumericField::Malformed(n.to_string()),
        },
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => NumericField::Value(v),
            _ => NumericField::Malformed(s.clone()),
        },
        Some(other) => NumericField::Malformed(other.to_string()),
    }
}

/// Read `key` as a string slice if it holds one.
pub fn str_field<'a>(payload: &'a Payload, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

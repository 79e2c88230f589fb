//! Canonical value tree for event bodies and metadata.
//!
//! The runtime is schema-agnostic: bodies and metadata are structured data
//! whose canonical wire form is JSON with two tagged leaves for the types
//! JSON cannot carry natively. Byte strings encode as
//! `{"$bytes": "<base64>"}` and instants as `{"$date": <unix millis>}`.

use std::collections::BTreeMap;

use base64::prelude::*;
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const BYTES_TAG: &str = "$bytes";
const DATE_TAG: &str = "$date";

/// A structured, canonically-encodable value.
///
/// Maps use `BTreeMap` so encoding is deterministic: equal values always
/// produce equal bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Instant with millisecond precision.
    Timestamp(i64),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn timestamp(at: DateTime<Utc>) -> Self {
        Value::Timestamp(at.timestamp_millis())
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ms) => DateTime::from_timestamp_millis(*ms),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Bytes(bytes) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(BYTES_TAG, &BASE64_STANDARD.encode(bytes))?;
                map.end()
            }
            Value::Timestamp(ms) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(DATE_TAG, ms)?;
                map.end()
            }
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        from_json(json).map_err(D::Error::custom)
    }
}

/// Convert a decoded JSON tree into a [`Value`], resolving the tagged leaves.
fn from_json(json: serde_json::Value) -> Result<Value, String> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(format!("unrepresentable number: {n}"));
            }
        }
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(from_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        serde_json::Value::Object(mut obj) => {
            if obj.len() == 1 {
                if let Some(serde_json::Value::String(encoded)) = obj.get(BYTES_TAG) {
                    let bytes = BASE64_STANDARD
                        .decode(encoded)
                        .map_err(|e| format!("invalid {BYTES_TAG} payload: {e}"))?;
                    return Ok(Value::Bytes(bytes));
                }
                if let Some(ms) = obj.get(DATE_TAG).and_then(serde_json::Value::as_i64) {
                    return Ok(Value::Timestamp(ms));
                }
            }
            let mut entries = BTreeMap::new();
            for (key, value) in obj.iter_mut() {
                entries.insert(key.clone(), from_json(value.take())?);
            }
            Value::Map(entries)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: &Value) -> Value {
        let bytes = serde_json::to_vec(value).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn scalars_round_trip() {
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Int(-42),
            Value::Float(1.5),
            Value::String("hello".into()),
        ] {
            assert_eq!(round_trip(&value), value);
        }
    }

    #[test]
    fn bytes_round_trip_through_tagged_form() {
        let value = Value::Bytes(vec![0, 159, 146, 150]);
        let json = serde_json::to_string(&value).unwrap();
        assert!(json.contains("$bytes"), "bytes must encode tagged: {json}");
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn timestamps_round_trip_with_millisecond_precision() {
        let at = Utc::now();
        let value = Value::timestamp(at);
        assert_eq!(round_trip(&value), value);
        assert_eq!(
            value.as_timestamp().unwrap().timestamp_millis(),
            at.timestamp_millis()
        );
    }

    #[test]
    fn nested_structures_round_trip() {
        let mut inner = BTreeMap::new();
        inner.insert("amount".to_string(), Value::Int(10));
        inner.insert("ctx".to_string(), Value::Bytes(vec![1, 2, 3]));
        let value = Value::Array(vec![Value::Map(inner), Value::Null, Value::Timestamp(1)]);
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn plain_maps_are_not_mistaken_for_tags() {
        let mut entries = BTreeMap::new();
        entries.insert("$bytes".to_string(), Value::Int(3));
        entries.insert("other".to_string(), Value::Null);
        let value = Value::Map(entries);
        // Two keys: the tag shape does not apply.
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn map_encoding_is_deterministic() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), Value::Int(2));
        a.insert("a".to_string(), Value::Int(1));
        let left = serde_json::to_vec(&Value::Map(a.clone())).unwrap();
        let right = serde_json::to_vec(&Value::Map(a)).unwrap();
        assert_eq!(left, right);
    }
}

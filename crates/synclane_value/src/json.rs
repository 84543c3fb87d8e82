//! JSON-compatible form of [`Value`].
//!
//! Values that plain JSON cannot carry losslessly are wrapped in a
//! single-key object whose key starts with `$`:
//!
//! | Value | JSON |
//! |-------|------|
//! | `Integer(42)` | `{"$integer": "42"}` |
//! | `Bytes([1, 2])` | `{"$bytes": "AQI="}` |
//! | `Float(NaN)` | `{"$float": "NaN"}` |
//!
//! Finite floats are plain JSON numbers. Because `$` keys are reserved for
//! these tags, user objects may not contain field names starting with `$`.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number};

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

const INTEGER_TAG: &str = "$integer";
const BYTES_TAG: &str = "$bytes";
const FLOAT_TAG: &str = "$float";

/// Converts a value into its JSON form.
///
/// Fails if an object contains a field name starting with `$`.
pub fn to_json(value: &Value) -> CodecResult<serde_json::Value> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Integer(n) => tagged(INTEGER_TAG, n.to_string()),
        Value::Float(f) => match Number::from_f64(*f) {
            Some(n) => serde_json::Value::Number(n),
            None => tagged(FLOAT_TAG, non_finite_name(*f).to_string()),
        },
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => tagged(BYTES_TAG, STANDARD.encode(b)),
        Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(to_json).collect::<CodecResult<_>>()?)
        }
        Value::Object(fields) => {
            let mut map = Map::with_capacity(fields.len());
            for (k, v) in fields {
                check_field_name(k)?;
                map.insert(k.clone(), to_json(v)?);
            }
            serde_json::Value::Object(map)
        }
    })
}

/// Converts a JSON form back into a value.
pub fn from_json(json: &serde_json::Value) -> CodecResult<Value> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(f) => Value::Float(f),
            None => return Err(CodecError::decoding_failed(format!("bad number {n}"))),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Array(items) => {
            Value::Array(items.iter().map(from_json).collect::<CodecResult<_>>()?)
        }
        serde_json::Value::Object(map) => {
            if let Some(value) = decode_tagged(map)? {
                return Ok(value);
            }
            let mut fields = BTreeMap::new();
            for (k, v) in map {
                check_field_name(k)?;
                fields.insert(k.clone(), from_json(v)?);
            }
            Value::Object(fields)
        }
    })
}

/// Serializes a value to a JSON string.
pub fn to_json_string(value: &Value) -> CodecResult<String> {
    serde_json::to_string(&to_json(value)?).map_err(|e| CodecError::encoding_failed(e.to_string()))
}

/// Parses a value from a JSON string.
pub fn from_json_str(s: &str) -> CodecResult<Value> {
    let json: serde_json::Value =
        serde_json::from_str(s).map_err(|e| CodecError::decoding_failed(e.to_string()))?;
    from_json(&json)
}

fn tagged(tag: &str, body: String) -> serde_json::Value {
    let mut map = Map::with_capacity(1);
    map.insert(tag.to_string(), serde_json::Value::String(body));
    serde_json::Value::Object(map)
}

fn non_finite_name(f: f64) -> &'static str {
    if f.is_nan() {
        "NaN"
    } else if f.is_sign_positive() {
        "Infinity"
    } else {
        "-Infinity"
    }
}

fn check_field_name(name: &str) -> CodecResult<()> {
    if name.starts_with('$') {
        return Err(CodecError::ReservedFieldName {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn decode_tagged(map: &Map<String, serde_json::Value>) -> CodecResult<Option<Value>> {
    if map.len() != 1 {
        return Ok(None);
    }
    let Some((tag, body)) = map.iter().next() else {
        return Ok(None);
    };
    if !tag.starts_with('$') {
        return Ok(None);
    }
    let body = body
        .as_str()
        .ok_or_else(|| CodecError::invalid_structure(format!("{tag} body must be a string")))?;

    match tag.as_str() {
        INTEGER_TAG => body
            .parse::<i64>()
            .map(|n| Some(Value::Integer(n)))
            .map_err(|_| CodecError::IntegerOverflow),
        BYTES_TAG => STANDARD
            .decode(body)
            .map(|b| Some(Value::Bytes(b)))
            .map_err(|e| CodecError::decoding_failed(e.to_string())),
        FLOAT_TAG => match body {
            "NaN" => Ok(Some(Value::Float(f64::NAN))),
            "Infinity" => Ok(Some(Value::Float(f64::INFINITY))),
            "-Infinity" => Ok(Some(Value::Float(f64::NEG_INFINITY))),
            other => Err(CodecError::invalid_structure(format!(
                "unknown float literal {other}"
            ))),
        },
        _ => Err(CodecError::ReservedFieldName { name: tag.clone() }),
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        to_json(self)
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        from_json(&json).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integers_are_tagged() {
        assert_eq!(to_json(&Value::Integer(-5)).unwrap(), json!({"$integer": "-5"}));
        assert_eq!(
            from_json(&json!({"$integer": "9223372036854775807"})).unwrap(),
            Value::Integer(i64::MAX)
        );
    }

    #[test]
    fn integer_overflow_is_rejected() {
        let err = from_json(&json!({"$integer": "9223372036854775808"})).unwrap_err();
        assert_eq!(err, CodecError::IntegerOverflow);
    }

    #[test]
    fn plain_numbers_are_floats() {
        assert_eq!(from_json(&json!(1.5)).unwrap(), Value::Float(1.5));
        assert_eq!(from_json(&json!(3)).unwrap(), Value::Float(3.0));
    }

    #[test]
    fn bytes_use_base64() {
        let json = to_json(&Value::Bytes(vec![1, 2])).unwrap();
        assert_eq!(json, json!({"$bytes": "AQI="}));
        assert_eq!(from_json(&json).unwrap(), Value::Bytes(vec![1, 2]));
    }

    #[test]
    fn non_finite_floats() {
        let json = to_json(&Value::Float(f64::NEG_INFINITY)).unwrap();
        assert_eq!(json, json!({"$float": "-Infinity"}));
        assert!(from_json(&json!({"$float": "NaN"}))
            .unwrap()
            .as_float()
            .is_some_and(f64::is_nan));
    }

    #[test]
    fn reserved_field_names() {
        let value = Value::object([("$id", Value::Null)]);
        assert!(matches!(
            to_json(&value),
            Err(CodecError::ReservedFieldName { .. })
        ));
        assert!(from_json(&json!({"$id": null, "x": 1})).is_err());
        assert!(from_json(&json!({"$weird": "1"})).is_err());
    }

    #[test]
    fn nested_documents() {
        let value = Value::object([
            ("emoji", Value::from("🙂")),
            ("tags", Value::Array(vec![Value::from(1i64), Value::Null])),
            ("raw", Value::Bytes(vec![0xff])),
        ]);
        let text = to_json_string(&value).unwrap();
        assert_eq!(from_json_str(&text).unwrap(), value);
    }

    #[test]
    fn serde_impls_use_json_form() {
        let value = Value::object([("n", Value::Integer(3))]);
        let text = serde_json::to_string(&value).unwrap();
        assert_eq!(text, r#"{"n":{"$integer":"3"}}"#);
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, value);
    }
}

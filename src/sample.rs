use crate::error::InferError;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use tracing::warn;

pub const TIMESTAMP_ATTR: &str = "timestamp";
pub const SERIAL_NUMBER_ATTR: &str = "serial_number";

/// 2^63 as f64; integral values strictly below this magnitude fit an i64.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

/// Attribute value after the ingestion boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Integer(i64),
    Decimal(f64),
    Timestamp(DateTime<Utc>),
    Nested(Json),
}

impl Value {
    /// Converts a decoded JSON value. Booleans and nulls have no column kind.
    pub fn from_json(name: &str, v: &Json) -> Result<Value, InferError> {
        match v {
            Json::String(s) => Ok(Value::Text(s.clone())),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Value::from_f64(name, f)
                } else {
                    Err(InferError::Unsupported {
                        name: name.to_string(),
                        kind: "number",
                    })
                }
            }
            Json::Array(_) | Json::Object(_) => Ok(Value::Nested(v.clone())),
            Json::Bool(_) => Err(InferError::Unsupported {
                name: name.to_string(),
                kind: "bool",
            }),
            Json::Null => Err(InferError::Unsupported {
                name: name.to_string(),
                kind: "null",
            }),
        }
    }

    pub fn from_f64(name: &str, f: f64) -> Result<Value, InferError> {
        if !f.is_finite() {
            return Err(InferError::NonFinite {
                name: name.to_string(),
                value: f,
            });
        }
        if is_integral(f) {
            Ok(Value::Integer(f as i64))
        } else {
            Ok(Value::Decimal(f))
        }
    }

    /// Interprets the value as a point in time: native timestamps, unix
    /// seconds, or RFC 3339 text.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            Value::Integer(secs) => Utc.timestamp_opt(*secs, 0).single(),
            Value::Text(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }
}

/// True when `f` has no fractional part and its magnitude fits an i64.
pub fn is_integral(f: f64) -> bool {
    f.is_finite() && f.trunc() == f && f.abs() < I64_BOUND
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub device_id: String,
    pub captured_at: DateTime<Utc>,
    pub attributes: BTreeMap<String, Value>,
}

impl Sample {
    /// Builds a sample and injects the `serial_number` and `timestamp`
    /// attributes when the source did not supply them.
    pub fn new(device_id: impl Into<String>, attributes: BTreeMap<String, Value>) -> Self {
        let mut sample = Sample {
            device_id: device_id.into(),
            captured_at: Utc::now(),
            attributes,
        };
        sample.inject_defaults();
        sample
    }

    /// Converts a flat JSON object, dropping attributes without a column kind.
    pub fn from_json_map(device_id: impl Into<String>, map: &Map<String, Json>) -> Self {
        let mut attributes = BTreeMap::new();
        for (k, v) in map {
            match Value::from_json(k, v) {
                Ok(value) => {
                    attributes.insert(k.clone(), value);
                }
                Err(e) => warn!(attribute = %k, error = %e, "dropping attribute"),
            }
        }
        Sample::new(device_id, attributes)
    }

    fn inject_defaults(&mut self) {
        if !self.attributes.contains_key(SERIAL_NUMBER_ATTR) {
            self.attributes.insert(
                SERIAL_NUMBER_ATTR.to_string(),
                Value::Text(self.device_id.clone()),
            );
        }
        match self.attributes.get(TIMESTAMP_ATTR).and_then(Value::as_timestamp) {
            Some(ts) => self.captured_at = ts,
            None if !self.attributes.contains_key(TIMESTAMP_ATTR) => {
                self.attributes
                    .insert(TIMESTAMP_ATTR.to_string(), Value::Timestamp(self.captured_at));
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_kinds() {
        assert_eq!(
            Value::from_json("a", &json!("x")).unwrap(),
            Value::Text("x".into())
        );
        assert_eq!(Value::from_json("a", &json!(42)).unwrap(), Value::Integer(42));
        assert_eq!(Value::from_json("a", &json!(4.0)).unwrap(), Value::Integer(4));
        assert_eq!(
            Value::from_json("a", &json!(4.25)).unwrap(),
            Value::Decimal(4.25)
        );
        assert!(matches!(
            Value::from_json("a", &json!([1, 2])).unwrap(),
            Value::Nested(_)
        ));
        assert!(Value::from_json("a", &json!(true)).is_err());
        assert!(Value::from_json("a", &json!(null)).is_err());
    }

    #[test]
    fn test_large_unsigned_is_decimal() {
        let v = Value::from_json("a", &json!(u64::MAX)).unwrap();
        assert!(matches!(v, Value::Decimal(_)));
    }

    #[test]
    fn test_defaults_injected() {
        let s = Sample::new("HW51", BTreeMap::new());
        assert_eq!(
            s.attributes.get(SERIAL_NUMBER_ATTR),
            Some(&Value::Text("HW51".into()))
        );
        assert_eq!(
            s.attributes.get(TIMESTAMP_ATTR),
            Some(&Value::Timestamp(s.captured_at))
        );
    }

    #[test]
    fn test_existing_attributes_kept() {
        let mut attrs = BTreeMap::new();
        attrs.insert(SERIAL_NUMBER_ATTR.to_string(), Value::Text("OTHER".into()));
        attrs.insert(TIMESTAMP_ATTR.to_string(), Value::Integer(1_743_087_465));
        let s = Sample::new("HW51", attrs);
        assert_eq!(
            s.attributes.get(SERIAL_NUMBER_ATTR),
            Some(&Value::Text("OTHER".into()))
        );
        assert_eq!(s.captured_at.timestamp(), 1_743_087_465);
    }

    #[test]
    fn test_from_json_map_drops_bools() {
        let map = json!({"a.b": 1, "flag": false})
            .as_object()
            .cloned()
            .unwrap();
        let s = Sample::from_json_map("sn", &map);
        assert!(s.attributes.contains_key("a.b"));
        assert!(!s.attributes.contains_key("flag"));
    }
}

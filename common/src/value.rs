use chrono::NaiveDateTime;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// The closed set of value kinds a decoded log cell can hold. The wire
/// protocols are schemaless or semi-schemaless, so rows are maps from
/// column name to one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum LogValue {
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	String(String),
	DateTime(NaiveDateTime),
	Array(Vec<LogValue>),
	Map(BTreeMap<String, LogValue>),
}

impl LogValue {
	pub fn as_f64(&self) -> Option<f64> {
		match self {
			LogValue::Int(i) => Some(*i as f64),
			LogValue::Float(f) => Some(*f),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			LogValue::String(s) => Some(s),
			_ => None,
		}
	}

	pub fn is_null(&self) -> bool {
		matches!(self, LogValue::Null)
	}
}

impl Serialize for LogValue {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		match self {
			LogValue::Null => serializer.serialize_unit(),
			LogValue::Bool(b) => serializer.serialize_bool(*b),
			LogValue::Int(i) => serializer.serialize_i64(*i),
			LogValue::Float(f) => serializer.serialize_f64(*f),
			LogValue::String(s) => serializer.serialize_str(s),
			LogValue::DateTime(t) => {
				serializer.serialize_str(&crate::format_rfc3339_millis(*t))
			}
			LogValue::Array(items) => {
				let mut seq = serializer.serialize_seq(Some(items.len()))?;
				for item in items {
					seq.serialize_element(item)?;
				}
				seq.end()
			}
			LogValue::Map(entries) => {
				let mut map = serializer.serialize_map(Some(entries.len()))?;
				for (k, v) in entries {
					map.serialize_entry(k, v)?;
				}
				map.end()
			}
		}
	}
}

impl From<serde_json::Value> for LogValue {
	fn from(v: serde_json::Value) -> Self {
		match v {
			serde_json::Value::Null => LogValue::Null,
			serde_json::Value::Bool(b) => LogValue::Bool(b),
			serde_json::Value::Number(n) => {
				if let Some(i) = n.as_i64() {
					LogValue::Int(i)
				} else {
					LogValue::Float(n.as_f64().unwrap_or(f64::NAN))
				}
			}
			serde_json::Value::String(s) => LogValue::String(s),
			serde_json::Value::Array(items) => {
				LogValue::Array(items.into_iter().map(LogValue::from).collect())
			}
			serde_json::Value::Object(entries) => LogValue::Map(
				entries
					.into_iter()
					.map(|(k, v)| (k, LogValue::from(v)))
					.collect(),
			),
		}
	}
}

impl From<&str> for LogValue {
	fn from(s: &str) -> Self {
		LogValue::String(s.to_string())
	}
}

impl From<i64> for LogValue {
	fn from(i: i64) -> Self {
		LogValue::Int(i)
	}
}

impl From<f64> for LogValue {
	fn from(f: f64) -> Self {
		LogValue::Float(f)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn test_from_json_value() {
		let j = serde_json::json!({
			"msg": "hello",
			"count": 3,
			"ratio": 0.5,
			"ok": true,
			"missing": null,
			"tags": ["a", "b"],
		});
		let v = LogValue::from(j);
		let LogValue::Map(m) = v else {
			panic!("expected map");
		};
		assert_eq!(Some(&LogValue::String("hello".to_string())), m.get("msg"));
		assert_eq!(Some(&LogValue::Int(3)), m.get("count"));
		assert_eq!(Some(&LogValue::Float(0.5)), m.get("ratio"));
		assert_eq!(Some(&LogValue::Bool(true)), m.get("ok"));
		assert_eq!(Some(&LogValue::Null), m.get("missing"));
		assert_eq!(
			Some(&LogValue::Array(vec![
				LogValue::String("a".to_string()),
				LogValue::String("b".to_string()),
			])),
			m.get("tags")
		);
	}

	#[test]
	fn test_serialize_datetime_as_rfc3339() {
		let t = chrono::NaiveDateTime::parse_from_str(
			"2024-01-15 10:00:00",
			"%Y-%m-%d %H:%M:%S",
		)
		.unwrap();
		let s = serde_json::to_string(&LogValue::DateTime(t)).unwrap();
		assert_eq!(r#""2024-01-15T10:00:00.000Z""#, s);
	}

	#[test]
	fn test_as_f64() {
		assert_eq!(Some(3.0), LogValue::Int(3).as_f64());
		assert_eq!(Some(0.5), LogValue::Float(0.5).as_f64());
		assert_eq!(None, LogValue::String("3".to_string()).as_f64());
		assert_eq!(None, LogValue::Null.as_f64());
	}
}

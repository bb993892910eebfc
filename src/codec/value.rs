use std::cmp::Ordering;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// A single SQLite cell value as carried in change records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
	Null,
	Integer(i64),
	Real(f64),
	Text(String),
	Blob(Vec<u8>),
}

impl Value {
	/// Total order used as the final merge tie-break.
	///
	/// NULL sorts first, then numbers (integers and reals compared by
	/// magnitude, an integer before an equal real), then text, then blobs.
	pub fn total_cmp(&self, other: &Value) -> Ordering {
		match (self, other) {
			(Value::Integer(a), Value::Integer(b)) => a.cmp(b),
			(Value::Real(a), Value::Real(b)) => a.total_cmp(b),
			(Value::Integer(a), Value::Real(b)) => (*a as f64).total_cmp(b).then(Ordering::Less),
			(Value::Real(a), Value::Integer(b)) => a.total_cmp(&(*b as f64)).then(Ordering::Greater),
			(Value::Text(a), Value::Text(b)) => a.cmp(b),
			(Value::Blob(a), Value::Blob(b)) => a.cmp(b),
			_ => self.class().cmp(&other.class()),
		}
	}

	pub fn is_null(&self) -> bool {
		matches!(self, Value::Null)
	}

	fn class(&self) -> u8 {
		match self {
			Value::Null => 0,
			Value::Integer(_) | Value::Real(_) => 1,
			Value::Text(_) => 2,
			Value::Blob(_) => 3,
		}
	}
}

impl From<i64> for Value {
	fn from(v: i64) -> Self {
		Value::Integer(v)
	}
}

impl From<f64> for Value {
	fn from(v: f64) -> Self {
		Value::Real(v)
	}
}

impl From<&str> for Value {
	fn from(v: &str) -> Self {
		Value::Text(v.to_string())
	}
}

impl From<String> for Value {
	fn from(v: String) -> Self {
		Value::Text(v)
	}
}

impl From<Vec<u8>> for Value {
	fn from(v: Vec<u8>) -> Self {
		Value::Blob(v)
	}
}

impl<T: Into<Value>> From<Option<T>> for Value {
	fn from(v: Option<T>) -> Self {
		v.map(Into::into).unwrap_or(Value::Null)
	}
}

impl ToSql for Value {
	fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
		let value = match self {
			Value::Null => ValueRef::Null,
			Value::Integer(i) => ValueRef::Integer(*i),
			Value::Real(r) => ValueRef::Real(*r),
			Value::Text(s) => ValueRef::Text(s.as_bytes()),
			Value::Blob(b) => ValueRef::Blob(b),
		};
		Ok(ToSqlOutput::Borrowed(value))
	}
}

impl FromSql for Value {
	fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
		Ok(match value {
			ValueRef::Null => Value::Null,
			ValueRef::Integer(i) => Value::Integer(i),
			ValueRef::Real(r) => Value::Real(r),
			ValueRef::Text(t) => Value::Text(
				std::str::from_utf8(t)
					.map_err(|e| FromSqlError::Other(Box::new(e)))?
					.to_string(),
			),
			ValueRef::Blob(b) => Value::Blob(b.to_vec()),
		})
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use std::cmp::Ordering;

	use super::Value;

	#[test]
	fn test_storage_class_order() {
		let ordered = [
			Value::Null,
			Value::Integer(-3),
			Value::Real(2.5),
			Value::Integer(7),
			Value::Text("a".into()),
			Value::Blob(vec![0]),
		];
		for pair in ordered.windows(2) {
			assert_eq!(pair[0].total_cmp(&pair[1]), Ordering::Less, "{:?}", pair);
		}
	}

	#[test]
	fn test_integer_and_equal_real_are_distinct() {
		assert_eq!(Value::Integer(1).total_cmp(&Value::Real(1.0)), Ordering::Less);
		assert_eq!(Value::Real(1.0).total_cmp(&Value::Integer(1)), Ordering::Greater);
		assert_eq!(Value::Text("x".into()).total_cmp(&Value::Text("x".into())), Ordering::Equal);
	}

	#[test]
	fn test_serde_shape() {
		let json = serde_json::to_string(&Value::Integer(4)).unwrap();
		assert_eq!(json, r#"{"type":"integer","value":4}"#);
		let null: Value = serde_json::from_str(r#"{"type":"null"}"#).unwrap();
		assert!(null.is_null());
	}
}

//! Driver-neutral row values returned by query operations.
//!
//! DuckDB values are narrowed to a small set of variants so that callers on
//! the event loop do not depend on the driver's own value type.

use std::fmt;

use duckdb::types::Value as DuckValue;
use serde::Serialize;

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// One result row, in column order.
pub type Row = Vec<Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Real(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Blob(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<DuckValue> for Value {
    fn from(value: DuckValue) -> Self {
        match value {
            DuckValue::Null => Value::Null,
            DuckValue::Boolean(v) => Value::Boolean(v),
            DuckValue::TinyInt(v) => Value::Integer(v.into()),
            DuckValue::SmallInt(v) => Value::Integer(v.into()),
            DuckValue::Int(v) => Value::Integer(v.into()),
            DuckValue::BigInt(v) => Value::Integer(v),
            DuckValue::UTinyInt(v) => Value::Integer(v.into()),
            DuckValue::USmallInt(v) => Value::Integer(v.into()),
            DuckValue::UInt(v) => Value::Integer(v.into()),
            DuckValue::UBigInt(v) => match i64::try_from(v) {
                Ok(v) => Value::Integer(v),
                Err(_) => Value::Text(v.to_string()),
            },
            DuckValue::HugeInt(v) => match i64::try_from(v) {
                Ok(v) => Value::Integer(v),
                Err(_) => Value::Text(v.to_string()),
            },
            DuckValue::Float(v) => Value::Real(v.into()),
            DuckValue::Double(v) => Value::Real(v),
            DuckValue::Text(v) | DuckValue::Enum(v) => Value::Text(v),
            DuckValue::Blob(v) => Value::Blob(v),
            other => Value::Text(format!("{other:?}")),
        }
    }
}

//! Record and scalar value types
//!
//! A [`Record`] is one ingestion event: the destination table plus an ordered
//! list of field names and the values aligned with them. Records arrive as flat
//! JSON objects whose first key carries the table identifier:
//!
//! ```text
//! {"table": "page_views", "url": "/home", "ms": 41, "cached": false}
//!           │                └────────── fields, in key order ─────────┘
//!           └─ table identifier (the key name itself is not significant)
//! ```

use crate::error::DecodeError;
use serde::{Serialize, Serializer};

/// A scalar column value
///
/// Serializes to the equivalent JSON scalar, which is what the
/// `JSONCompactEachRow` bulk format expects. JSON has no NaN or infinity, so
/// non-finite floats are written as the strings `"nan"`, `"inf"` and `"-inf"`,
/// the same words the `Values` format uses and that ClickHouse reads back
/// into float columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
}

impl Value {
    /// Convert a JSON value, returning `None` for arrays and objects
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(Value::Null),
            serde_json::Value::Bool(b) => Some(Value::Bool(b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::Int(i))
                } else if let Some(u) = n.as_u64() {
                    Some(Value::UInt(u))
                } else {
                    n.as_f64().map(Value::Float)
                }
            }
            serde_json::Value::String(s) => Some(Value::String(s)),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }
}

/// ClickHouse spelling of a non-finite float
pub(crate) fn non_finite_literal(f: f64) -> Option<&'static str> {
    if f.is_nan() {
        Some("nan")
    } else if f == f64::INFINITY {
        Some("inf")
    } else if f == f64::NEG_INFINITY {
        Some("-inf")
    } else {
        None
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::UInt(u) => serializer.serialize_u64(*u),
            Value::Float(f) => match non_finite_literal(*f) {
                Some(literal) => serializer.serialize_str(literal),
                None => serializer.serialize_f64(*f),
            },
            Value::String(s) => serializer.serialize_str(s),
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
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Value::UInt(u)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Null, Into::into)
    }
}

/// One decoded ingestion event
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Destination table identifier
    pub table: String,
    /// Field names in payload order
    pub fields: Vec<String>,
    /// Values aligned with `fields`
    pub values: Vec<Value>,
}

impl Record {
    /// Build a record from parallel field/value lists
    ///
    /// # Example
    ///
    /// ```
    /// use kasa_gateway::record::{Record, Value};
    ///
    /// let record = Record::new("page_views", [("url", Value::from("/home")), ("ms", Value::from(41i64))]);
    /// assert_eq!(record.fields, vec!["url", "ms"]);
    /// assert_eq!(record.width(), 2);
    /// ```
    pub fn new<K, I>(table: impl Into<String>, fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let (fields, values): (Vec<String>, Vec<Value>) =
            fields.into_iter().map(|(k, v)| (k.into(), v)).unzip();
        Self {
            table: table.into(),
            fields,
            values,
        }
    }

    /// Decode a record from a flat JSON object
    ///
    /// The first key's value is the table identifier; every other key becomes a
    /// field, in document order. Nested values are rejected here so that the
    /// batch encoder never has to.
    pub fn from_json(body: &[u8]) -> Result<Self, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| DecodeError::Json(e.to_string()))?;

        let serde_json::Value::Object(map) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let mut entries = map.into_iter();

        let (table_key, table) = entries.next().ok_or(DecodeError::MissingTable)?;
        let table = match table {
            serde_json::Value::String(s) if !s.is_empty() => s,
            _ => return Err(DecodeError::InvalidTable { key: table_key }),
        };

        let mut fields = Vec::new();
        let mut values = Vec::new();
        for (field, value) in entries {
            if field.is_empty() {
                return Err(DecodeError::EmptyFieldName);
            }
            let value =
                Value::from_json(value).ok_or_else(|| DecodeError::NonScalar { field: field.clone() })?;
            fields.push(field);
            values.push(value);
        }

        if fields.is_empty() {
            return Err(DecodeError::NoFields { table });
        }

        Ok(Self {
            table,
            fields,
            values,
        })
    }

    /// Number of fields (the group width inside a table buffer)
    pub fn width(&self) -> usize {
        self.fields.len()
    }
}

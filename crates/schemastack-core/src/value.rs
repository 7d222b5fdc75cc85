//! Attribute values
//!
//! A [`Value`] is what a record holds for a single attribute or relationship.
//! Each value maps onto one SQLite storage class:
//!
//! | kind      | column    | encoding                       |
//! |-----------|-----------|--------------------------------|
//! | `text`    | `TEXT`    | UTF-8                          |
//! | `integer` | `INTEGER` | i64                            |
//! | `real`    | `REAL`    | f64                            |
//! | `boolean` | `INTEGER` | 0 / 1                          |
//! | `date`    | `INTEGER` | milliseconds since Unix epoch  |
//! | `binary`  | `BLOB`    | raw bytes                      |

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::{FromSqlError, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Declared type of an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
    Text,
    Integer,
    Real,
    Boolean,
    Date,
    Binary,
}

impl AttributeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeKind::Text => "text",
            AttributeKind::Integer => "integer",
            AttributeKind::Real => "real",
            AttributeKind::Boolean => "boolean",
            AttributeKind::Date => "date",
            AttributeKind::Binary => "binary",
        }
    }

    /// SQLite column type used to store this kind
    pub(crate) fn column_type(&self) -> &'static str {
        match self {
            AttributeKind::Text => "TEXT",
            AttributeKind::Integer | AttributeKind::Boolean | AttributeKind::Date => "INTEGER",
            AttributeKind::Real => "REAL",
            AttributeKind::Binary => "BLOB",
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single attribute value
///
/// In model and mapping files values are written as tagged tables,
/// e.g. `{ text = "hello" }` or `{ date = "1970-01-01T00:00:00Z" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    #[default]
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    /// Stored with millisecond precision; finer parts are dropped on write,
    /// so a value read back may differ from the one written
    Date(DateTime<Utc>),
    Binary(Vec<u8>),
}

impl Value {
    /// Kind of this value, `None` for `Null`
    pub fn kind(&self) -> Option<AttributeKind> {
        match self {
            Value::Null => None,
            Value::Text(_) => Some(AttributeKind::Text),
            Value::Integer(_) => Some(AttributeKind::Integer),
            Value::Real(_) => Some(AttributeKind::Real),
            Value::Boolean(_) => Some(AttributeKind::Boolean),
            Value::Date(_) => Some(AttributeKind::Date),
            Value::Binary(_) => Some(AttributeKind::Binary),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value may be stored in an attribute of `kind`
    ///
    /// `Null` fits every kind; optionality is checked separately.
    pub fn fits(&self, kind: AttributeKind) -> bool {
        match self.kind() {
            None => true,
            Some(own) => own == kind,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(r) => Some(*r),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Decode a column value stored for an attribute of `kind`
    pub(crate) fn from_column(kind: AttributeKind, raw: ValueRef<'_>) -> Result<Self, FromSqlError> {
        if let ValueRef::Null = raw {
            return Ok(Value::Null);
        }

        let value = match kind {
            AttributeKind::Text => Value::Text(raw.as_str()?.to_string()),
            AttributeKind::Integer => Value::Integer(raw.as_i64()?),
            AttributeKind::Real => match raw {
                ValueRef::Integer(i) => Value::Real(i as f64),
                other => Value::Real(other.as_f64()?),
            },
            AttributeKind::Boolean => Value::Boolean(raw.as_i64()? != 0),
            AttributeKind::Date => {
                let millis = raw.as_i64()?;
                let date = Utc
                    .timestamp_millis_opt(millis)
                    .single()
                    .ok_or(FromSqlError::OutOfRange(millis))?;
                Value::Date(date)
            }
            AttributeKind::Binary => Value::Binary(raw.as_blob()?.to_vec()),
        };
        Ok(value)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Integer(i) => ToSqlOutput::Owned((*i).into()),
            Value::Real(r) => ToSqlOutput::Owned((*r).into()),
            Value::Boolean(b) => ToSqlOutput::Owned(i64::from(*b).into()),
            Value::Date(d) => ToSqlOutput::Owned(d.timestamp_millis().into()),
            Value::Binary(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Date(d) => write!(f, "{}", d.to_rfc3339()),
            Value::Binary(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Date(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Binary(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

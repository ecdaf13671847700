//! Values crossing the adapter boundary.
//!
//! The adapter must preserve 64-bit integers and byte arrays
//! end-to-end, so the engine carries its own value enum instead
//! of leaning on JSON numbers.

use indexmap::IndexMap;
use serde_json::{json, Value as Json};

use crate::error::Error;
use crate::util::{base64_decode, base64_encode};

/// A single SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// JSON form used in oplog rows. Blobs are wrapped so they
    /// survive the round-trip unambiguously.
    pub fn to_json(&self) -> Json {
        match self {
            SqlValue::Null => Json::Null,
            SqlValue::Integer(i) => json!(i),
            SqlValue::Real(r) => json!(r),
            SqlValue::Text(s) => json!(s),
            SqlValue::Blob(b) => json!({ "$base64": base64_encode(b) }),
        }
    }

    pub fn from_json(value: &Json) -> Result<Self, Error> {
        match value {
            Json::Null => Ok(SqlValue::Null),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(SqlValue::Integer(i))
                } else if let Some(r) = n.as_f64() {
                    Ok(SqlValue::Real(r))
                } else {
                    Err(Error::Internal(format!("unrepresentable number: {}", n)))
                }
            }
            Json::String(s) => Ok(SqlValue::Text(s.clone())),
            Json::Object(map) => match map.get("$base64") {
                Some(Json::String(encoded)) => Ok(SqlValue::Blob(base64_decode(encoded)?)),
                _ => Err(Error::Internal("unexpected object value".into())),
            },
            other => Err(Error::Internal(format!("unexpected value: {}", other))),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.into())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<Option<String>> for SqlValue {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(s) => SqlValue::Text(s),
            None => SqlValue::Null,
        }
    }
}

/// One result row. Insertion order preserved so emitted SQL
/// has deterministic column order.
pub type Row = IndexMap<String, SqlValue>;

/// Serialize a row to the stable JSON used in oplog columns.
pub fn row_to_json(row: &Row) -> String {
    // BTreeMap for stable key order regardless of capture order.
    let map: std::collections::BTreeMap<&str, Json> =
        row.iter().map(|(k, v)| (k.as_str(), v.to_json())).collect();
    serde_json::to_string(&map).expect("row encoding is infallible")
}

pub fn row_from_json(raw: &str) -> Result<Row, Error> {
    let parsed: serde_json::Map<String, Json> = serde_json::from_str(raw)?;
    let mut row = Row::new();
    for (key, value) in parsed {
        row.insert(key, SqlValue::from_json(&value)?);
    }
    Ok(row)
}

/// SQL text plus bound arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, args: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }

    pub fn simple(sql: impl Into<String>) -> Self {
        Self::new(sql, vec![])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_value_json_roundtrip() {
        let values = vec![
            SqlValue::Null,
            SqlValue::Integer(i64::MAX),
            SqlValue::Real(1.5),
            SqlValue::Text("hello".into()),
            SqlValue::Blob(vec![0, 255, 1]),
        ];
        for value in values {
            let json = value.to_json();
            assert_eq!(SqlValue::from_json(&json).unwrap(), value);
        }
    }

    #[test]
    fn test_row_json_is_canonical() {
        let mut a = Row::new();
        a.insert("b".into(), SqlValue::Integer(2));
        a.insert("a".into(), SqlValue::Integer(1));

        let mut b = Row::new();
        b.insert("a".into(), SqlValue::Integer(1));
        b.insert("b".into(), SqlValue::Integer(2));

        // Same contents, different insertion order, same encoding.
        assert_eq!(row_to_json(&a), row_to_json(&b));

        let decoded = row_from_json(&row_to_json(&a)).unwrap();
        assert_eq!(decoded.get("a"), Some(&SqlValue::Integer(1)));
        assert_eq!(decoded.get("b"), Some(&SqlValue::Integer(2)));
    }

    #[test]
    fn test_blob_survives_row_roundtrip() {
        let mut row = Row::new();
        row.insert("payload".into(), SqlValue::Blob(vec![1, 2, 3]));
        let decoded = row_from_json(&row_to_json(&row)).unwrap();
        assert_eq!(decoded.get("payload"), Some(&SqlValue::Blob(vec![1, 2, 3])));
    }
}

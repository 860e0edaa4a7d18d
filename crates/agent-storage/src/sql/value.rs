//! Backend-neutral parameter values and result rows

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{Result, StorageError};

/// A value bound to a statement parameter or read back from a row.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(Value),
}

/// Column name to value, used by the generic insert/load operations.
pub type Record = BTreeMap<String, SqlValue>;

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Maps a JSON value onto the closest scalar. Objects and arrays stay JSON.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => SqlValue::Json(value.clone()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(i) => Value::from(*i),
            SqlValue::Real(f) => Value::from(*f),
            SqlValue::Text(s) => Value::String(s.clone()),
            SqlValue::Timestamp(ts) => Value::String(format_timestamp(ts)),
            SqlValue::Json(v) => v.clone(),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        SqlValue::Text(v.clone())
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl From<Value> for SqlValue {
    fn from(v: Value) -> Self {
        SqlValue::Json(v)
    }
}

impl From<Map<String, Value>> for SqlValue {
    fn from(v: Map<String, Value>) -> Self {
        SqlValue::Json(Value::Object(v))
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

/// Builds a [`Record`] from a JSON object, e.g. a caller-supplied row.
pub fn record_from_json(object: &Map<String, Value>) -> Record {
    object
        .iter()
        .map(|(k, v)| (k.clone(), SqlValue::from_json(v)))
        .collect()
}

/// Fixed-width RFC 3339 so stored text sorts chronologically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    None
}

fn decode_error(column: &str, expected: &str, found: &SqlValue) -> StorageError {
    StorageError::third_party(
        "STORAGE_ROW_DECODE_FAILED",
        format!("column {column}: expected {expected}, found {found:?}"),
    )
    .with_detail("column", column)
}

/// One result row. Column names are shared across the rows of a result set.
#[derive(Debug, Clone)]
pub struct SqlRow {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    pub fn value_at(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    fn require(&self, column: &str) -> Result<&SqlValue> {
        self.get(column).ok_or_else(|| {
            StorageError::third_party(
                "STORAGE_ROW_DECODE_FAILED",
                format!("column {column} missing from result set"),
            )
            .with_detail("column", column)
        })
    }

    pub fn text(&self, column: &str) -> Result<String> {
        match self.require(column)? {
            SqlValue::Text(s) => Ok(s.clone()),
            SqlValue::Integer(i) => Ok(i.to_string()),
            SqlValue::Real(f) => Ok(f.to_string()),
            SqlValue::Timestamp(ts) => Ok(format_timestamp(ts)),
            SqlValue::Json(v) => Ok(v.to_string()),
            other => Err(decode_error(column, "text", other)),
        }
    }

    pub fn opt_text(&self, column: &str) -> Result<Option<String>> {
        match self.require(column)? {
            SqlValue::Null => Ok(None),
            _ => self.text(column).map(Some),
        }
    }

    pub fn integer(&self, column: &str) -> Result<i64> {
        match self.require(column)? {
            SqlValue::Integer(i) => Ok(*i),
            SqlValue::Real(f) => Ok(*f as i64),
            SqlValue::Text(s) => s.parse().map_err(|_| decode_error(column, "integer", &SqlValue::Text(s.clone()))),
            other => Err(decode_error(column, "integer", other)),
        }
    }

    pub fn timestamp(&self, column: &str) -> Result<DateTime<Utc>> {
        match self.require(column)? {
            SqlValue::Timestamp(ts) => Ok(*ts),
            SqlValue::Text(s) => {
                parse_timestamp(s).ok_or_else(|| decode_error(column, "timestamp", &SqlValue::Text(s.clone())))
            }
            other => Err(decode_error(column, "timestamp", other)),
        }
    }

    /// Strict JSON decoding: stored text must parse.
    pub fn json(&self, column: &str) -> Result<Value> {
        match self.require(column)? {
            SqlValue::Null => Ok(Value::Null),
            SqlValue::Json(v) => Ok(v.clone()),
            SqlValue::Text(s) => Ok(serde_json::from_str(s)?),
            other => Ok(other.to_json()),
        }
    }

    pub fn opt_json(&self, column: &str) -> Result<Option<Value>> {
        self.json(column).map(|v| if v.is_null() { None } else { Some(v) })
    }

    pub fn json_object(&self, column: &str) -> Result<Map<String, Value>> {
        match self.json(column)? {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Map::new()),
            other => Err(decode_error(column, "JSON object", &SqlValue::Json(other))),
        }
    }

    /// The whole row as a JSON object, column name to value.
    pub fn to_json_object(&self) -> Map<String, Value> {
        self.columns
            .iter()
            .zip(&self.values)
            .map(|(c, v)| (c.clone(), v.to_json()))
            .collect()
    }
}

//! Driver-independent values and rows.
//!
//! Rows are produced once by a driver and never mutated afterwards. Column
//! names are shared between all rows of one result via `Arc`.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::Arc;

// Re-export serde_json::Value for JSON support
pub use serde_json::Value as JsonValue;

/// A single column value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(JsonValue),
}

impl Value {
    /// Check if this value is NULL.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to get as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    /// Try to get as f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get as bool. SQLite stores booleans as integers.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// Try to get as string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
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
        Value::Bytes(v)
    }
}

impl From<JsonValue> for Value {
    fn from(v: JsonValue) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Column names shared by every row of a result.
pub type SharedColumns = Arc<Vec<String>>;

/// A row stored as column values.
/// Uses SmallVec to inline storage for rows with ≤16 columns (most tables),
/// avoiding heap allocation for typical workloads.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    columns: SharedColumns,
    values: SmallVec<[Value; 16]>,
}

impl Row {
    pub fn new(columns: SharedColumns, values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            columns,
            values: values.into_iter().collect(),
        }
    }

    /// Value at a column position.
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Value by column name.
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == name)?;
        self.values.get(idx)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Consume the row into its first value (used by scalar fetches).
    pub fn into_first(self) -> Option<Value> {
        self.values.into_iter().next()
    }
}

/// Shared, immutable row snapshot. Cache hits hand out clones of the `Arc`.
pub type SharedRows = Arc<Vec<Row>>;

/// Result of running a statement on a connection.
#[derive(Debug, Default)]
pub struct QueryResult {
    /// Column names
    pub columns: SharedColumns,
    /// Row data
    pub rows: Vec<Row>,
    /// Rows affected (for INSERT/UPDATE/DELETE)
    pub rows_affected: u64,
}

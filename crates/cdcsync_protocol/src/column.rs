//! Row payloads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Type identifier the remote uses for text columns.
pub const TEXT_TYPE_ID: i32 = 25;

/// A single column value as it appears on the wire.
///
/// The remote encodes each column as `{"value": ..., "type": <oid>}`.
/// `value` is kept as a JSON scalar so numbers, booleans and nulls survive
/// the trip into SQLite unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnValue {
    /// The column value.
    #[serde(default)]
    pub value: serde_json::Value,
    /// Remote type identifier.
    #[serde(rename = "type", default)]
    pub type_id: i32,
}

impl ColumnValue {
    /// Creates a text column value.
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            value: serde_json::Value::String(value.into()),
            type_id: TEXT_TYPE_ID,
        }
    }

    /// Creates a null column value.
    pub fn null() -> Self {
        Self {
            value: serde_json::Value::Null,
            type_id: TEXT_TYPE_ID,
        }
    }

    /// Returns true if the value is null.
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    /// Returns the value rendered as text, or `None` for null.
    pub fn as_text(&self) -> Option<String> {
        match &self.value {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// A row: column name to value.
///
/// Ordered so that SQL synthesized from a row lists columns
/// deterministically.
pub type Row = BTreeMap<String, ColumnValue>;

/// Builds a row of text columns.
pub fn text_row<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Row {
    pairs
        .into_iter()
        .map(|(column, value)| (column.to_string(), ColumnValue::text(value)))
        .collect()
}

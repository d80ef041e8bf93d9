//! Change records and change batches.

use crate::column::Row;
use crate::error::{ProtocolError, ProtocolResult};
use crate::table::{normalize_table_name, KnownTables};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Type of row-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Operation {
    /// Row was inserted.
    Insert,
    /// Row was updated.
    Update,
    /// Row was deleted.
    Delete,
}

impl Operation {
    /// Converts to the numeric wire code.
    pub fn to_code(&self) -> u8 {
        match self {
            Operation::Insert => 1,
            Operation::Update => 2,
            Operation::Delete => 3,
        }
    }

    /// Converts from a numeric wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Operation::Insert),
            2 => Some(Operation::Update),
            3 => Some(Operation::Delete),
            _ => None,
        }
    }

    /// Lowercase name, for logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl From<Operation> for u8 {
    fn from(op: Operation) -> u8 {
        op.to_code()
    }
}

impl TryFrom<u8> for Operation {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Operation::from_code(code).ok_or(ProtocolError::UnknownOperation(code))
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single row-level change from the change feed.
///
/// Inserts carry `new_row`, deletes carry `old_row`, updates carry both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Type of change.
    pub operation: Operation,
    /// Wire table name (`group.table`).
    pub table: String,
    /// Per-change sequence, if the server sends one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<String>,
    /// Commit log position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sequence: Option<u64>,
    /// Change log position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_sequence: Option<u64>,
    /// Index within the commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_index: Option<u32>,
    /// Source transaction id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<u64>,
    /// Row after the change (insert, update).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_row: Option<Row>,
    /// Row before the change (update, delete).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_row: Option<Row>,
}

impl Change {
    fn new(operation: Operation, table: impl Into<String>) -> Self {
        Self {
            operation,
            table: table.into(),
            sequence: None,
            commit_sequence: None,
            change_sequence: None,
            commit_index: None,
            txid: None,
            new_row: None,
            old_row: None,
        }
    }

    /// Creates an insert change.
    pub fn insert(table: impl Into<String>, new_row: Row) -> Self {
        Self {
            new_row: Some(new_row),
            ..Self::new(Operation::Insert, table)
        }
    }

    /// Creates an update change.
    pub fn update(table: impl Into<String>, old_row: Row, new_row: Row) -> Self {
        Self {
            old_row: Some(old_row),
            new_row: Some(new_row),
            ..Self::new(Operation::Update, table)
        }
    }

    /// Creates a delete change.
    pub fn delete(table: impl Into<String>, old_row: Row) -> Self {
        Self {
            old_row: Some(old_row),
            ..Self::new(Operation::Delete, table)
        }
    }

    /// Local (normalized) table name.
    pub fn local_table(&self) -> String {
        normalize_table_name(&self.table)
    }
}

/// An ordered batch of changes since a cursor position.
///
/// `last_sequence` is an opaque cursor; it is stored and sent back verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeList {
    /// Cursor before the first change.
    #[serde(default)]
    pub first_sequence: String,
    /// Cursor after the last change.
    #[serde(default)]
    pub last_sequence: String,
    /// Changes in source order.
    #[serde(default)]
    pub changes: Vec<Change>,
}

impl ChangeList {
    /// Creates a batch.
    pub fn new(
        first_sequence: impl Into<String>,
        last_sequence: impl Into<String>,
        changes: Vec<Change>,
    ) -> Self {
        Self {
            first_sequence: first_sequence.into(),
            last_sequence: last_sequence.into(),
            changes,
        }
    }

    /// Decodes a batch from JSON.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encodes the batch as JSON.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Returns true if the batch has no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Distinct wire table names referenced by the batch.
    pub fn tables(&self) -> BTreeSet<&str> {
        self.changes.iter().map(|c| c.table.as_str()).collect()
    }

    /// Returns the first table the known set does not contain.
    ///
    /// An empty known set cannot vouch for anything, so every batch is
    /// flagged against it, including an empty batch.
    pub fn unknown_table<'a>(&'a self, known: &KnownTables) -> Option<&'a str> {
        if known.is_empty() {
            return Some(self.changes.first().map_or("", |c| c.table.as_str()));
        }
        self.changes
            .iter()
            .map(|c| c.table.as_str())
            .find(|table| !known.contains(table))
    }

    /// Returns true if applying the batch requires a fresh snapshot.
    pub fn requires_new_snapshot(&self, known: &KnownTables) -> bool {
        self.unknown_table(known).is_some()
    }
}

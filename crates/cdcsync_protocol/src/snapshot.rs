//! Full-state snapshots.

use crate::column::Row;
use crate::error::ProtocolResult;
use crate::table::KnownTables;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Column assumed to be the key when a table declares none.
const DEFAULT_KEY_COLUMN: &str = "id";

/// A full-state snapshot of one or more scopes.
///
/// A snapshot with no tables is the sentinel for "already present locally":
/// it names a generation that exists on disk and must not be re-ingested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Snapshot identifier. Also names the local database generation.
    #[serde(default)]
    pub snapshot_info: String,
    /// Server-side creation time, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Table contents.
    #[serde(default)]
    pub tables: Vec<Table>,
}

impl Snapshot {
    /// Creates a snapshot with the given tables.
    pub fn new(snapshot_info: impl Into<String>, tables: Vec<Table>) -> Self {
        Self {
            snapshot_info: snapshot_info.into(),
            timestamp: None,
            tables,
        }
    }

    /// Creates the table-less sentinel for a generation already on disk.
    pub fn local(snapshot_info: impl Into<String>) -> Self {
        Self::new(snapshot_info, Vec::new())
    }

    /// Decodes a structured snapshot body.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encodes the snapshot as JSON.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Returns true for the table-less sentinel.
    pub fn is_sentinel(&self) -> bool {
        self.tables.is_empty()
    }

    /// Tables carried by the snapshot, normalized.
    pub fn known_tables(&self) -> KnownTables {
        KnownTables::from_names(self.tables.iter().map(|t| t.name.as_str()))
    }

    /// Looks up a table by wire name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// One table inside a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    /// Wire table name (`group.table`).
    pub name: String,
    /// Declared primary key columns, if the server sent them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_keys: Vec<String>,
    /// Rows.
    #[serde(default)]
    pub rows: Vec<Row>,
}

impl Table {
    /// Creates a table with rows and no declared keys.
    pub fn new(name: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            name: name.into(),
            primary_keys: Vec::new(),
            rows,
        }
    }

    /// Sets the declared primary key columns.
    pub fn with_primary_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Sorted union of the columns seen across all rows.
    pub fn columns(&self) -> Vec<String> {
        let mut columns = BTreeSet::new();
        for row in &self.rows {
            columns.extend(row.keys().cloned());
        }
        columns.into_iter().collect()
    }

    /// Key columns: the declared keys, else `id` when such a column exists.
    pub fn key_columns(&self) -> Vec<String> {
        if !self.primary_keys.is_empty() {
            return self.primary_keys.clone();
        }
        if self.rows.iter().any(|row| row.contains_key(DEFAULT_KEY_COLUMN)) {
            vec![DEFAULT_KEY_COLUMN.to_string()]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::text_row;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_structured_snapshot() {
        let body = br#"{
            "snapshotInfo": "snap-1",
            "timestamp": "2017-01-01T00:00:00Z",
            "tables": [
                {"name": "kms.app", "rows": [
                    {"id": {"value": "a", "type": 25}, "name": {"value": "x", "type": 25}}
                ]}
            ]
        }"#;
        let snapshot = Snapshot::decode(body).unwrap();
        assert_eq!(snapshot.snapshot_info, "snap-1");
        assert!(!snapshot.is_sentinel());
        assert!(snapshot.known_tables().contains("kms_app"));
        let table = snapshot.table("kms.app").unwrap();
        assert_eq!(table.columns(), vec!["id".to_string(), "name".to_string()]);
        assert_eq!(table.key_columns(), vec!["id".to_string()]);
    }

    #[test]
    fn sentinel_has_no_tables() {
        let snapshot = Snapshot::local("snap-2");
        assert!(snapshot.is_sentinel());
        assert!(snapshot.known_tables().is_empty());
    }

    #[test]
    fn columns_are_union_of_rows() {
        let table = Table::new(
            "kms.app",
            vec![text_row([("b", "1")]), text_row([("a", "2"), ("c", "3")])],
        );
        assert_eq!(table.columns(), vec!["a", "b", "c"]);
        assert!(table.key_columns().is_empty());
    }

    #[test]
    fn declared_keys_win() {
        let table = Table::new("kms.app", vec![text_row([("id", "1"), ("org", "o")])])
            .with_primary_keys(["org", "id"]);
        assert_eq!(table.key_columns(), vec!["org", "id"]);
    }
}

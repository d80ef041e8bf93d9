//! Table naming and the known-tables set.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Wire name of the cluster descriptor table.
pub const CLUSTER_TABLE: &str = "edgex.apid_cluster";

/// Wire name of the data scope table.
pub const DATA_SCOPE_TABLE: &str = "edgex.data_scope";

/// Maps a wire table name (`group.table`) to its local name (`group_table`).
///
/// Only the first separator is replaced; names without one pass through.
pub fn normalize_table_name(name: &str) -> String {
    name.replacen('.', "_", 1)
}

/// The set of tables present in the last applied snapshot.
///
/// Names are stored normalized. A change referencing a table outside this
/// set means the local schema is stale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownTables {
    tables: BTreeSet<String>,
}

impl KnownTables {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set from wire or local names.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            tables: names
                .into_iter()
                .map(|name| normalize_table_name(name.as_ref()))
                .collect(),
        }
    }

    /// Adds a table.
    pub fn insert(&mut self, name: &str) {
        self.tables.insert(normalize_table_name(name));
    }

    /// Returns true if the table (wire or local name) is known.
    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains(&normalize_table_name(name))
    }

    /// Number of known tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Returns true if no tables are known.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Iterates the normalized table names in order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_first_separator_only() {
        assert_eq!(normalize_table_name("kms.api_product"), "kms_api_product");
        assert_eq!(normalize_table_name("a.b.c"), "a_b.c");
        assert_eq!(normalize_table_name("plain"), "plain");
    }

    #[test]
    fn contains_accepts_wire_and_local_names() {
        let known = KnownTables::from_names(["edgex.data_scope", "kms_app"]);
        assert!(known.contains("edgex.data_scope"));
        assert!(known.contains("edgex_data_scope"));
        assert!(known.contains("kms.app"));
        assert!(!known.contains("kms.developer"));
        assert_eq!(known.len(), 2);
    }
}

//! Snapshot and change fixtures.
//!
//! Models a cluster with the two privileged tables and one replicated
//! application table, `kms.app`.

use cdcsync_protocol::{
    normalize_table_name, text_row, Change, Row, Snapshot, Table, CLUSTER_TABLE,
    DATA_SCOPE_TABLE, TEXT_TYPE_ID,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{ConnectOptions, Connection};
use std::time::Duration;
use tempfile::TempDir;

/// Cluster id used by the fixtures.
pub const CLUSTER_ID: &str = "cluster-1";

/// Replicated application table.
pub const APP_TABLE: &str = "kms.app";

/// Row of the cluster table.
pub fn cluster_row(cluster_id: &str) -> Row {
    text_row([("id", cluster_id), ("name", "test cluster")])
}

/// Row of the data scope table.
pub fn data_scope_row(id: &str, cluster_id: &str, scope: &str) -> Row {
    text_row([
        ("id", id),
        ("apid_cluster_id", cluster_id),
        ("scope", scope),
        ("org", "org-1"),
        ("env", "test"),
    ])
}

/// Row of the application table.
pub fn app_row(id: &str, name: &str) -> Row {
    text_row([("id", id), ("name", name)])
}

/// Boot snapshot: the cluster row and its data scopes.
///
/// `scopes` holds `(id, scope)` pairs.
pub fn boot_snapshot(cluster_id: &str, scopes: &[(&str, &str)]) -> Snapshot {
    Snapshot::new("boot", cluster_tables(cluster_id, scopes))
}

/// Data snapshot: the boot tables plus application rows.
///
/// `apps` holds `(id, name)` pairs.
pub fn data_snapshot(
    id: &str,
    cluster_id: &str,
    scopes: &[(&str, &str)],
    apps: &[(&str, &str)],
) -> Snapshot {
    let mut tables = cluster_tables(cluster_id, scopes);
    let rows = apps.iter().map(|(id, name)| app_row(id, name)).collect();
    tables.push(Table::new(APP_TABLE, rows).with_primary_keys(["id"]));
    Snapshot::new(id, tables)
}

fn cluster_tables(cluster_id: &str, scopes: &[(&str, &str)]) -> Vec<Table> {
    let scope_rows = scopes
        .iter()
        .map(|(id, scope)| data_scope_row(id, cluster_id, scope))
        .collect();
    vec![
        Table::new(CLUSTER_TABLE, vec![cluster_row(cluster_id)]).with_primary_keys(["id"]),
        Table::new(DATA_SCOPE_TABLE, scope_rows).with_primary_keys(["id"]),
    ]
}

/// Change inserting a data scope.
pub fn scope_insert(id: &str, cluster_id: &str, scope: &str) -> Change {
    Change::insert(DATA_SCOPE_TABLE, data_scope_row(id, cluster_id, scope))
}

/// Change inserting an application row.
pub fn app_insert(id: &str, name: &str) -> Change {
    Change::insert(APP_TABLE, app_row(id, name))
}

/// Encodes `snapshot` as a SQLite database file.
///
/// Every column is stored as TEXT. Column and key metadata are written to
/// `_transicator_tables` the way a binary snapshot server does.
pub async fn sqlite_snapshot_bytes(snapshot: &Snapshot) -> Vec<u8> {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let path = dir.path().join("snapshot.sqlite3");
    let mut conn = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .busy_timeout(Duration::from_secs(5))
        .connect()
        .await
        .expect("Failed to create snapshot database");

    sqlx::query(
        "CREATE TABLE _transicator_tables (tableName TEXT, columnName TEXT, typid INTEGER, primaryKey BOOL)",
    )
    .execute(&mut conn)
    .await
    .expect("Failed to create metadata table");

    for table in &snapshot.tables {
        let local = normalize_table_name(&table.name);
        let columns = table.columns();
        let keys = table.key_columns();

        let mut definitions: Vec<String> =
            columns.iter().map(|c| format!("\"{c}\" TEXT")).collect();
        if !keys.is_empty() {
            let quoted: Vec<String> = keys.iter().map(|k| format!("\"{k}\"")).collect();
            definitions.push(format!("PRIMARY KEY ({})", quoted.join(", ")));
        }
        sqlx::query(&format!("CREATE TABLE \"{local}\" ({})", definitions.join(", ")))
            .execute(&mut conn)
            .await
            .expect("Failed to create snapshot table");

        for column in &columns {
            sqlx::query("INSERT INTO _transicator_tables VALUES (?1, ?2, ?3, ?4)")
                .bind(&local)
                .bind(column)
                .bind(TEXT_TYPE_ID)
                .bind(keys.contains(column))
                .execute(&mut conn)
                .await
                .expect("Failed to record column metadata");
        }

        let quoted: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO \"{local}\" ({}) VALUES ({})",
            quoted.join(", "),
            placeholders.join(", ")
        );
        for row in &table.rows {
            let mut query = sqlx::query(&sql);
            for column in &columns {
                query = query.bind(row.get(column).and_then(|value| value.as_text()));
            }
            query
                .execute(&mut conn)
                .await
                .expect("Failed to insert snapshot row");
        }
    }

    conn.close().await.expect("Failed to close snapshot database");
    tokio::fs::read(&path)
        .await
        .expect("Failed to read snapshot database")
}

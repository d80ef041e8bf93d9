//! Table metadata lookup and SQL value binding.

use crate::error::SyncResult;
use cdcsync_protocol::ColumnValue;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnection};
use sqlx::{Row, Sqlite};

/// Name of the table holding column and primary-key metadata.
pub const METADATA_TABLE: &str = "_transicator_tables";

/// Columns and primary keys of one local table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableInfo {
    /// Local table name.
    pub name: String,
    /// All columns, sorted.
    pub columns: Vec<String>,
    /// Primary key columns, in key order.
    pub primary_keys: Vec<String>,
}

impl TableInfo {
    /// Returns true if the table exists locally.
    pub fn exists(&self) -> bool {
        !self.columns.is_empty()
    }
}

/// Looks up a table's columns and primary keys.
///
/// Metadata recorded with the snapshot wins; tables it does not describe
/// fall back to SQLite's own schema.
pub async fn table_info(conn: &mut SqliteConnection, table: &str) -> SyncResult<TableInfo> {
    if metadata_table_exists(conn).await? {
        let rows = sqlx::query(
            r#"
SELECT columnName, CASE WHEN primaryKey THEN 1 ELSE 0 END AS pk
FROM _transicator_tables
WHERE tableName = ?1
ORDER BY columnName
            "#,
        )
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;
        if !rows.is_empty() {
            let mut info = TableInfo {
                name: table.to_string(),
                ..Default::default()
            };
            for row in rows {
                let column: String = row.try_get("columnName")?;
                let pk: i64 = row.try_get("pk")?;
                if pk != 0 {
                    info.primary_keys.push(column.clone());
                }
                info.columns.push(column);
            }
            return Ok(info);
        }
    }

    let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
        .fetch_all(&mut *conn)
        .await?;
    let mut keyed = Vec::new();
    let mut columns = Vec::new();
    for row in rows {
        let column: String = row.try_get("name")?;
        let pk: i64 = row.try_get("pk")?;
        if pk > 0 {
            keyed.push((pk, column.clone()));
        }
        columns.push(column);
    }
    columns.sort();
    keyed.sort();
    Ok(TableInfo {
        name: table.to_string(),
        columns,
        primary_keys: keyed.into_iter().map(|(_, column)| column).collect(),
    })
}

/// Returns true if the named table exists.
pub async fn table_exists(conn: &mut SqliteConnection, table: &str) -> SyncResult<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .bind(table)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count > 0)
}

async fn metadata_table_exists(conn: &mut SqliteConnection) -> SyncResult<bool> {
    table_exists(conn, METADATA_TABLE).await
}

/// Quotes an identifier for SQLite.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// SQLite column type for a remote type id.
pub fn sqlite_type(type_id: i32) -> &'static str {
    match type_id {
        16 | 20 | 21 | 23 => "INTEGER",
        700 | 701 | 1700 => "REAL",
        17 => "BLOB",
        _ => "TEXT",
    }
}

/// A value ready to bind to a statement placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Integer, including booleans.
    Integer(i64),
    /// Floating point.
    Real(f64),
    /// Text. Arrays and objects are stored as their JSON text.
    Text(String),
}

impl From<&serde_json::Value> for SqlValue {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => SqlValue::Null,
            serde_json::Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Integer(i),
                None => SqlValue::Real(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }
}

impl From<&ColumnValue> for SqlValue {
    fn from(value: &ColumnValue) -> Self {
        SqlValue::from(&value.value)
    }
}

/// Binds values to a query in placeholder order.
pub fn bind_values<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    values: &[SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in values {
        query = match value {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(i) => query.bind(*i),
            SqlValue::Real(f) => query.bind(*f),
            SqlValue::Text(s) => query.bind(s.clone()),
        };
    }
    query
}

//! Local SQLite storage: the default database and snapshot generations.
//!
//! The default database holds the instance identity and the known-tables
//! set. Each applied snapshot lives in its own generation database under
//! `generations/<id>/snapshot.sqlite3`; exactly one generation is current
//! at a time and swapping it is the only write to the shared lock.

use crate::error::{SyncError, SyncResult};
use crate::identity::InstanceIdentity;
use crate::scope_cache::DataScope;
use crate::schema::{self, bind_values, quote_ident, sqlite_type, SqlValue, METADATA_TABLE};
use cdcsync_protocol::{
    normalize_table_name, KnownTables, Snapshot, CLUSTER_TABLE, DATA_SCOPE_TABLE,
};
use parking_lot::RwLock;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// File name of the default database.
pub const DEFAULT_DB_FILE: &str = "default.sqlite3";

/// File name of a generation database inside its directory.
pub const GENERATION_DB_FILE: &str = "snapshot.sqlite3";

/// Generation id used for boot snapshots.
pub const BOOTSTRAP_GENERATION: &str = "bootstrap";

/// Column on the cluster table holding the change cursor.
pub const SEQUENCE_COLUMN: &str = "last_sequence";

/// An open snapshot generation.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Snapshot id naming the generation.
    pub id: String,
    /// Connection pool for the generation database.
    pub pool: SqlitePool,
}

/// Durable local state.
pub struct LocalStore {
    data_dir: PathBuf,
    default_pool: SqlitePool,
    current: RwLock<Option<Generation>>,
}

impl LocalStore {
    /// Opens (creating if needed) the store rooted at `data_dir`.
    pub async fn open(data_dir: impl Into<PathBuf>) -> SyncResult<Self> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(data_dir.join("generations")).await?;
        let options = SqliteConnectOptions::new()
            .filename(data_dir.join(DEFAULT_DB_FILE))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let default_pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS instance_identity (
    instance_id TEXT PRIMARY KEY,
    cluster_id TEXT NOT NULL,
    last_snapshot_info TEXT NOT NULL DEFAULT ''
)
            "#,
        )
        .execute(&default_pool)
        .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS known_tables (table_name TEXT PRIMARY KEY)")
            .execute(&default_pool)
            .await?;

        debug!(dir = %data_dir.display(), "opened local store");
        Ok(Self {
            data_dir,
            default_pool,
            current: RwLock::new(None),
        })
    }

    /// Root directory of the store.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Pool for the default database.
    pub fn default_pool(&self) -> &SqlitePool {
        &self.default_pool
    }

    // ---- identity ----

    /// Loads the persisted identity, creating one if none exists.
    ///
    /// A persisted identity for a different cluster is discarded and a fresh
    /// one generated, forgetting the last snapshot.
    pub async fn load_or_create_identity(
        &self,
        instance_name: &str,
        cluster_id: &str,
    ) -> SyncResult<InstanceIdentity> {
        let mut tx = self.default_pool.begin().await?;
        let row = sqlx::query(
            "SELECT instance_id, cluster_id, last_snapshot_info FROM instance_identity LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let identity = match row {
            Some(row) => {
                let saved_cluster: String = row.try_get("cluster_id")?;
                if saved_cluster == cluster_id {
                    InstanceIdentity {
                        instance_id: row.try_get("instance_id")?,
                        instance_name: instance_name.to_string(),
                        cluster_id: saved_cluster,
                        last_snapshot: row.try_get("last_snapshot_info")?,
                        is_new: false,
                    }
                } else {
                    info!(
                        saved = %saved_cluster,
                        configured = %cluster_id,
                        "cluster id changed, starting clean"
                    );
                    sqlx::query("DELETE FROM instance_identity")
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query("DELETE FROM known_tables")
                        .execute(&mut *tx)
                        .await?;
                    let identity = InstanceIdentity::generate(instance_name, cluster_id);
                    insert_identity(&mut tx, &identity).await?;
                    identity
                }
            }
            None => {
                let identity = InstanceIdentity::generate(instance_name, cluster_id);
                debug!(instance_id = %identity.instance_id, "generated instance id");
                insert_identity(&mut tx, &identity).await?;
                identity
            }
        };
        tx.commit().await?;
        Ok(identity)
    }

    /// Reads the persisted identity without creating one.
    ///
    /// The instance name is not persisted and comes back empty.
    pub async fn saved_identity(&self) -> SyncResult<Option<InstanceIdentity>> {
        let row = sqlx::query(
            "SELECT instance_id, cluster_id, last_snapshot_info FROM instance_identity LIMIT 1",
        )
        .fetch_optional(&self.default_pool)
        .await?;
        row.map(|row| -> SyncResult<InstanceIdentity> {
            Ok(InstanceIdentity {
                instance_id: row.try_get("instance_id")?,
                instance_name: String::new(),
                cluster_id: row.try_get("cluster_id")?,
                last_snapshot: row.try_get("last_snapshot_info")?,
                is_new: false,
            })
        })
        .transpose()
    }

    /// Persists the identity, replacing any previous one.
    ///
    /// Any failure is reported as `Fatal`.
    pub async fn save_identity(&self, identity: &InstanceIdentity) -> SyncResult<()> {
        let saved: SyncResult<()> = async {
            let mut tx = self.default_pool.begin().await?;
            sqlx::query("DELETE FROM instance_identity")
                .execute(&mut *tx)
                .await?;
            insert_identity(&mut tx, identity).await?;
            tx.commit().await?;
            Ok(())
        }
        .await;
        saved.map_err(|e| SyncError::Fatal(format!("failed to persist instance identity: {e}")))
    }

    // ---- known tables ----

    /// Loads the persisted known-tables set.
    pub async fn known_tables(&self) -> SyncResult<KnownTables> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT table_name FROM known_tables ORDER BY table_name")
                .fetch_all(&self.default_pool)
                .await?;
        Ok(KnownTables::from_names(names))
    }

    /// Replaces the persisted known-tables set.
    pub async fn replace_known_tables(&self, tables: &KnownTables) -> SyncResult<()> {
        let mut tx = self.default_pool.begin().await?;
        sqlx::query("DELETE FROM known_tables")
            .execute(&mut *tx)
            .await?;
        for name in tables.iter() {
            sqlx::query("INSERT INTO known_tables (table_name) VALUES (?1)")
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ---- generations ----

    /// Path of a generation database.
    pub fn generation_path(&self, id: &str) -> PathBuf {
        self.data_dir
            .join("generations")
            .join(sanitize_generation_id(id))
            .join(GENERATION_DB_FILE)
    }

    /// Returns true if a generation database exists on disk.
    pub fn generation_exists(&self, id: &str) -> bool {
        self.generation_path(id).is_file()
    }

    /// Opens (creating if needed) a generation database.
    pub async fn open_generation(&self, id: &str) -> SyncResult<Generation> {
        let path = self.generation_path(id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(Generation {
            id: id.to_string(),
            pool: open_database(&path).await?,
        })
    }

    /// A fresh path for a download in progress, on the same filesystem as
    /// the generations so it can be renamed into place.
    pub fn scratch_path(&self) -> PathBuf {
        self.data_dir
            .join("generations")
            .join(format!(".incoming-{}.sqlite3", uuid::Uuid::new_v4()))
    }

    /// Moves a downloaded database file into place as generation `id`.
    ///
    /// If `id` is the current generation it is closed first and the store
    /// has no current generation until the caller switches to the result.
    pub async fn install_generation_file(&self, id: &str, file: &Path) -> SyncResult<Generation> {
        let taken = {
            let mut current = self.current.write();
            if current.as_ref().is_some_and(|g| g.id == id) {
                current.take()
            } else {
                None
            }
        };
        if let Some(old) = taken {
            old.pool.close().await;
        }

        let path = self.generation_path(id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        for suffix in ["-wal", "-shm", "-journal"] {
            let mut stale = path.clone().into_os_string();
            stale.push(suffix);
            if let Err(err) = tokio::fs::remove_file(&stale).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    return Err(err.into());
                }
            }
        }
        tokio::fs::rename(file, &path).await?;
        self.open_generation(id).await
    }

    /// Makes `generation` current, closing the one it replaces.
    pub async fn switch_generation(&self, generation: Generation) {
        let id = generation.id.clone();
        let old = self.current.write().replace(generation);
        if let Some(old) = old {
            if old.id != id {
                old.pool.close().await;
            }
        }
        info!(generation = %id, "switched snapshot generation");
    }

    /// The current generation, if any.
    pub fn current_generation(&self) -> Option<Generation> {
        self.current.read().clone()
    }

    /// Pool for the current generation.
    pub fn current_pool(&self) -> SyncResult<SqlitePool> {
        self.current
            .read()
            .as_ref()
            .map(|g| g.pool.clone())
            .ok_or_else(|| SyncError::Fatal("no snapshot generation is open".into()))
    }

    /// Closes every open pool.
    pub async fn close(&self) {
        let current = self.current.write().take();
        if let Some(generation) = current {
            generation.pool.close().await;
        }
        self.default_pool.close().await;
    }

    // ---- generation contents ----

    /// Lists the replicated tables present in a generation.
    pub async fn introspect_tables(&self, pool: &SqlitePool) -> SyncResult<KnownTables> {
        let mut conn = pool.acquire().await?;
        let names: Vec<String> = if schema::table_exists(&mut conn, METADATA_TABLE).await? {
            sqlx::query_scalar("SELECT DISTINCT tableName FROM _transicator_tables")
                .fetch_all(&mut *conn)
                .await?
        } else {
            sqlx::query_scalar(
                r#"
SELECT name FROM sqlite_master
WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '\_%' ESCAPE '\'
                "#,
            )
            .fetch_all(&mut *conn)
            .await?
        };
        Ok(KnownTables::from_names(names))
    }

    /// Ensures the cluster table has a sequence column.
    pub async fn ensure_sequence_column(&self, pool: &SqlitePool) -> SyncResult<()> {
        let mut conn = pool.acquire().await?;
        let table = normalize_table_name(CLUSTER_TABLE);
        if !schema::table_exists(&mut conn, &table).await? {
            warn!(table = %table, "snapshot has no cluster table");
            return Ok(());
        }
        let pragma = format!("PRAGMA table_info({})", quote_ident(&table));
        let columns: Vec<String> = sqlx::query(&pragma)
            .fetch_all(&mut *conn)
            .await?
            .iter()
            .map(|row| row.try_get("name"))
            .collect::<Result<_, _>>()?;
        if !columns.iter().any(|c| c == SEQUENCE_COLUMN) {
            debug!(table = %table, "adding sequence column");
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN {SEQUENCE_COLUMN} TEXT DEFAULT ''",
                quote_ident(&table)
            ))
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// Reads the change cursor from a generation. Empty if none is stored.
    pub async fn last_sequence(&self, pool: &SqlitePool) -> SyncResult<String> {
        let mut conn = pool.acquire().await?;
        let table = normalize_table_name(CLUSTER_TABLE);
        if !schema::table_exists(&mut conn, &table).await? {
            return Ok(String::new());
        }
        let sequence: Option<Option<String>> = sqlx::query_scalar(&format!(
            "SELECT {SEQUENCE_COLUMN} FROM {} LIMIT 1",
            quote_ident(&table)
        ))
        .fetch_optional(&mut *conn)
        .await?;
        Ok(sequence.flatten().unwrap_or_default())
    }

    /// Stores the change cursor in a generation.
    pub async fn update_last_sequence(&self, pool: &SqlitePool, sequence: &str) -> SyncResult<()> {
        let mut conn = pool.acquire().await?;
        write_sequence(&mut conn, sequence).await
    }

    /// Distinct scopes assigned to `cluster_id` in a generation.
    pub async fn find_scopes(
        &self,
        pool: &SqlitePool,
        cluster_id: &str,
    ) -> SyncResult<Vec<String>> {
        let mut conn = pool.acquire().await?;
        let table = normalize_table_name(DATA_SCOPE_TABLE);
        if !schema::table_exists(&mut conn, &table).await? {
            return Ok(Vec::new());
        }
        let scopes: Vec<Option<String>> = sqlx::query_scalar(&format!(
            "SELECT DISTINCT scope FROM {} WHERE apid_cluster_id = ?1 ORDER BY scope",
            quote_ident(&table)
        ))
        .bind(cluster_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(scopes
            .into_iter()
            .flatten()
            .filter(|scope| !scope.is_empty())
            .collect())
    }

    /// Data scope rows assigned to `cluster_id` in a generation.
    pub async fn load_data_scopes(
        &self,
        pool: &SqlitePool,
        cluster_id: &str,
    ) -> SyncResult<Vec<DataScope>> {
        let mut conn = pool.acquire().await?;
        let table = normalize_table_name(DATA_SCOPE_TABLE);
        if !schema::table_exists(&mut conn, &table).await? {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT * FROM {} WHERE apid_cluster_id = ?1",
            quote_ident(&table)
        ))
        .bind(cluster_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.iter().map(DataScope::from_sql_row).collect())
    }

    /// Writes a structured snapshot's tables into a generation.
    ///
    /// Tables are created with the union of their rows' columns and the
    /// table's key columns as primary key; column metadata is recorded in
    /// `_transicator_tables` for later SQL synthesis.
    pub async fn ingest_snapshot(&self, pool: &SqlitePool, snapshot: &Snapshot) -> SyncResult<()> {
        let mut tx = pool.begin().await?;
        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS _transicator_tables (
    tableName TEXT NOT NULL,
    columnName TEXT NOT NULL,
    typid INTEGER,
    primaryKey BOOL,
    UNIQUE (tableName, columnName)
)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        for table in &snapshot.tables {
            let local = normalize_table_name(&table.name);
            let columns = table.columns();
            let keys = table.key_columns();

            let mut definitions: Vec<String> = columns
                .iter()
                .map(|column| {
                    let type_id = table
                        .rows
                        .iter()
                        .find_map(|row| row.get(column).map(|v| v.type_id))
                        .unwrap_or_default();
                    format!("{} {}", quote_ident(column), sqlite_type(type_id))
                })
                .collect();
            if !keys.is_empty() {
                let quoted: Vec<String> = keys.iter().map(|k| quote_ident(k)).collect();
                definitions.push(format!("PRIMARY KEY ({})", quoted.join(", ")));
            }
            if definitions.is_empty() {
                warn!(table = %table.name, "skipping table with no columns");
                continue;
            }
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                quote_ident(&local),
                definitions.join(", ")
            ))
            .execute(&mut *tx)
            .await?;

            for column in &columns {
                let type_id = table
                    .rows
                    .iter()
                    .find_map(|row| row.get(column).map(|v| v.type_id))
                    .unwrap_or_default();
                sqlx::query(
                    "INSERT OR REPLACE INTO _transicator_tables (tableName, columnName, typid, primaryKey) VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(&local)
                .bind(column)
                .bind(type_id)
                .bind(keys.contains(column))
                .execute(&mut *tx)
                .await?;
            }

            let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
            let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(&local),
                quoted.join(", "),
                placeholders.join(", ")
            );
            for row in &table.rows {
                let values: Vec<SqlValue> = columns
                    .iter()
                    .map(|column| row.get(column).map_or(SqlValue::Null, SqlValue::from))
                    .collect();
                bind_values(sqlx::query(&sql), &values)
                    .execute(&mut *tx)
                    .await?;
            }
            debug!(table = %local, rows = table.rows.len(), "ingested snapshot table");
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Writes the change cursor on `conn`.
///
/// Pass a transaction to make the cursor commit together with the rows it
/// covers.
pub async fn write_sequence(conn: &mut SqliteConnection, sequence: &str) -> SyncResult<()> {
    let table = normalize_table_name(CLUSTER_TABLE);
    sqlx::query(&format!(
        "UPDATE {} SET {SEQUENCE_COLUMN} = ?1",
        quote_ident(&table)
    ))
    .bind(sequence)
    .execute(&mut *conn)
    .await?;
    info!(sequence = %sequence, "replication sequence advanced");
    Ok(())
}

/// Opens (creating if needed) a database file with rollback journaling.
pub async fn open_database(path: &Path) -> SyncResult<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete)
        .busy_timeout(Duration::from_secs(5));
    Ok(SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?)
}

async fn insert_identity(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    identity: &InstanceIdentity,
) -> SyncResult<()> {
    sqlx::query(
        "INSERT INTO instance_identity (instance_id, cluster_id, last_snapshot_info) VALUES (?1, ?2, ?3)",
    )
    .bind(&identity.instance_id)
    .bind(&identity.cluster_id)
    .bind(&identity.last_snapshot)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Maps a snapshot id to a safe directory name.
fn sanitize_generation_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        format!("_{cleaned}")
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdcsync_protocol::{text_row, Table};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn store() -> (TempDir, LocalStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn identity_persists_across_opens() {
        let dir = TempDir::new().unwrap();
        let first = {
            let store = LocalStore::open(dir.path()).await.unwrap();
            let identity = store.load_or_create_identity("edge", "c1").await.unwrap();
            assert!(identity.is_new);
            store.close().await;
            identity
        };
        let store = LocalStore::open(dir.path()).await.unwrap();
        let again = store.load_or_create_identity("edge", "c1").await.unwrap();
        assert_eq!(again.instance_id, first.instance_id);
        assert!(!again.is_new);
    }

    #[tokio::test]
    async fn saved_identity_does_not_create() {
        let (_dir, store) = store().await;
        assert!(store.saved_identity().await.unwrap().is_none());
        let created = store.load_or_create_identity("edge", "c1").await.unwrap();
        let saved = store.saved_identity().await.unwrap().unwrap();
        assert_eq!(saved.instance_id, created.instance_id);
        assert!(!saved.is_new);
    }

    #[tokio::test]
    async fn failed_identity_save_is_fatal() {
        let (_dir, store) = store().await;
        let identity = store.load_or_create_identity("edge", "c1").await.unwrap();
        sqlx::query("DROP TABLE instance_identity")
            .execute(store.default_pool())
            .await
            .unwrap();

        let err = store.save_identity(&identity).await.unwrap_err();
        assert!(matches!(err, SyncError::Fatal(_)));
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn cluster_change_starts_clean() {
        let (_dir, store) = store().await;
        let mut identity = store.load_or_create_identity("edge", "c1").await.unwrap();
        identity.last_snapshot = "snap-1".into();
        store.save_identity(&identity).await.unwrap();
        store
            .replace_known_tables(&KnownTables::from_names(["kms.app"]))
            .await
            .unwrap();

        let moved = store.load_or_create_identity("edge", "c2").await.unwrap();
        assert_ne!(moved.instance_id, identity.instance_id);
        assert!(moved.last_snapshot.is_empty());
        assert!(moved.is_new);
        assert!(store.known_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn known_tables_round_trip() {
        let (_dir, store) = store().await;
        let tables = KnownTables::from_names(["kms.app", "edgex.data_scope"]);
        store.replace_known_tables(&tables).await.unwrap();
        assert_eq!(store.known_tables().await.unwrap(), tables);
    }

    #[tokio::test]
    async fn ingests_structured_snapshot() {
        let (_dir, store) = store().await;
        let snapshot = Snapshot::new(
            "snap-1",
            vec![
                Table::new(
                    CLUSTER_TABLE,
                    vec![text_row([("id", "c1"), ("name", "cluster")])],
                ),
                Table::new(
                    DATA_SCOPE_TABLE,
                    vec![
                        text_row([("id", "s1"), ("apid_cluster_id", "c1"), ("scope", "a")]),
                        text_row([("id", "s2"), ("apid_cluster_id", "c1"), ("scope", "b")]),
                        text_row([("id", "s3"), ("apid_cluster_id", "other"), ("scope", "z")]),
                    ],
                ),
            ],
        );
        let generation = store.open_generation("snap-1").await.unwrap();
        store.ingest_snapshot(&generation.pool, &snapshot).await.unwrap();

        let tables = store.introspect_tables(&generation.pool).await.unwrap();
        assert!(tables.contains(CLUSTER_TABLE));
        assert!(tables.contains(DATA_SCOPE_TABLE));
        assert_eq!(tables.len(), 2);

        let scopes = store.find_scopes(&generation.pool, "c1").await.unwrap();
        assert_eq!(scopes, vec!["a", "b"]);
        let rows = store.load_data_scopes(&generation.pool, "c1").await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn sequence_column_is_added_and_tracked() {
        let (_dir, store) = store().await;
        let snapshot = Snapshot::new(
            "snap-1",
            vec![Table::new(CLUSTER_TABLE, vec![text_row([("id", "c1")])])],
        );
        let generation = store.open_generation("snap-1").await.unwrap();
        store.ingest_snapshot(&generation.pool, &snapshot).await.unwrap();
        store.ensure_sequence_column(&generation.pool).await.unwrap();
        store.ensure_sequence_column(&generation.pool).await.unwrap();

        assert_eq!(store.last_sequence(&generation.pool).await.unwrap(), "");
        store
            .update_last_sequence(&generation.pool, "17.4.0")
            .await
            .unwrap();
        assert_eq!(store.last_sequence(&generation.pool).await.unwrap(), "17.4.0");
    }

    #[tokio::test]
    async fn switching_generations() {
        let (_dir, store) = store().await;
        assert!(store.current_pool().is_err());
        let first = store.open_generation("g1").await.unwrap();
        store.switch_generation(first).await;
        assert_eq!(store.current_generation().unwrap().id, "g1");
        assert!(store.generation_exists("g1"));
        assert!(!store.generation_exists("g2"));

        let second = store.open_generation("g2").await.unwrap();
        store.switch_generation(second).await;
        assert_eq!(store.current_generation().unwrap().id, "g2");
    }

    #[test]
    fn generation_ids_are_sanitized() {
        assert_eq!(sanitize_generation_id("abc-1.2"), "abc-1.2");
        assert_eq!(sanitize_generation_id("../etc"), ".._etc");
        assert_eq!(sanitize_generation_id(".."), "_..");
        assert_eq!(sanitize_generation_id(""), "_");
    }
}

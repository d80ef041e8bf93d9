//! Transactional application of change batches to the current generation.
//!
//! Each batch runs in a single SQLite transaction together with the write
//! of its change cursor. SQL is synthesized per record from the row
//! contents and the table's primary keys, so any failing record rolls back
//! the whole batch and the cursor is not advanced.

use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::identity::SharedIdentity;
use crate::schema::{bind_values, quote_ident, table_info, SqlValue, TableInfo};
use crate::scope_cache::{DataScope, ScopeCache};
use crate::store::{write_sequence, LocalStore};
use cdcsync_protocol::{Change, ChangeList, Operation, Row, CLUSTER_TABLE, DATA_SCOPE_TABLE};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Scope cache edit to perform once the batch has committed.
#[derive(Debug)]
enum ScopeEdit {
    Upsert(DataScope),
    Remove(String),
}

/// Applies change batches to the local replica.
pub struct ChangeApplier {
    store: Arc<LocalStore>,
    cache: ScopeCache,
    identity: SharedIdentity,
}

impl ChangeApplier {
    /// Creates an applier.
    pub fn new(store: Arc<LocalStore>, cache: ScopeCache, identity: SharedIdentity) -> Self {
        Self {
            store,
            cache,
            identity,
        }
    }

    /// Applies every change in the batch, or none of them.
    ///
    /// A non-empty `last_sequence` is stored in the same transaction, so a
    /// committed batch is never fetched again after a restart.
    pub async fn apply(&self, changes: &ChangeList) -> SyncResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let pool = self.store.current_pool()?;
        let cluster_id = self.identity.read().cluster_id.clone();

        let mut tx = pool.begin().await?;
        let mut tables: HashMap<String, TableInfo> = HashMap::new();
        let mut scope_edits = Vec::new();

        for change in &changes.changes {
            check_allowed(change)?;
            let table = change.local_table();
            if !tables.contains_key(&table) {
                let info = table_info(&mut tx, &table).await?;
                tables.insert(table.clone(), info);
            }
            let info = &tables[&table];

            match change.operation {
                Operation::Insert => {
                    let row = required_row(change, change.new_row.as_ref())?;
                    let (sql, values) = build_insert_sql(&table, row);
                    bind_values(sqlx::query(&sql), &values)
                        .execute(&mut *tx)
                        .await?;
                }
                Operation::Update => {
                    let row = required_row(change, change.new_row.as_ref())?;
                    let (sql, values) = build_update_sql(info, change.old_row.as_ref(), row)?;
                    let result = bind_values(sqlx::query(&sql), &values)
                        .execute(&mut *tx)
                        .await?;
                    if result.rows_affected() == 0 {
                        warn!(table = %table, "update matched no rows");
                    }
                }
                Operation::Delete => {
                    let row = required_row(change, change.old_row.as_ref())?;
                    let (sql, values) = build_delete_sql(info, row)?;
                    let result = bind_values(sqlx::query(&sql), &values)
                        .execute(&mut *tx)
                        .await?;
                    if result.rows_affected() == 0 {
                        return Err(SyncError::RowNotFound { table });
                    }
                }
            }

            if change.table == DATA_SCOPE_TABLE {
                if let Some(edit) = scope_edit(change, &cluster_id) {
                    scope_edits.push(edit);
                }
            }
        }

        if !changes.last_sequence.is_empty() {
            write_sequence(&mut tx, &changes.last_sequence)
                .await
                .map_err(|e| SyncError::SequencePersistence(e.to_string()))?;
        }

        tx.commit().await?;
        debug!(
            changes = changes.len(),
            last_sequence = %changes.last_sequence,
            "applied change batch"
        );

        for edit in scope_edits {
            match edit {
                ScopeEdit::Upsert(scope) => self.cache.update(scope).await?,
                ScopeEdit::Remove(id) => self.cache.remove(id).await?,
            }
        }
        Ok(())
    }

    /// Subscribes to `bus` and applies every published batch.
    ///
    /// Each delivery is acknowledged with the apply result.
    pub fn spawn_subscriber(self: Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let mut deliveries = bus.subscribe();
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let result = match &delivery.event {
                    SyncEvent::Changes(changes) => {
                        let result = self.apply(changes).await;
                        if let Err(err) = &result {
                            error!(error = %err, "failed to apply change batch");
                        }
                        result
                    }
                    SyncEvent::Snapshot(snapshot) => {
                        debug!(snapshot = %snapshot.snapshot_info, "snapshot is live");
                        Ok(())
                    }
                };
                delivery.acknowledge(result);
            }
        })
    }
}

fn check_allowed(change: &Change) -> SyncResult<()> {
    let illegal = match change.table.as_str() {
        CLUSTER_TABLE => matches!(change.operation, Operation::Insert | Operation::Update),
        DATA_SCOPE_TABLE => change.operation == Operation::Update,
        _ => false,
    };
    if illegal {
        return Err(SyncError::illegal(&change.table, change.operation));
    }
    Ok(())
}

fn required_row<'a>(change: &Change, row: Option<&'a Row>) -> SyncResult<&'a Row> {
    row.ok_or_else(|| SyncError::MissingRow {
        table: change.local_table(),
        operation: change.operation.to_string(),
    })
}

fn scope_edit(change: &Change, cluster_id: &str) -> Option<ScopeEdit> {
    match change.operation {
        Operation::Insert => {
            let scope = DataScope::from_change_row(change.new_row.as_ref()?);
            (scope.cluster_id == cluster_id).then_some(ScopeEdit::Upsert(scope))
        }
        Operation::Delete => {
            let scope = DataScope::from_change_row(change.old_row.as_ref()?);
            (scope.cluster_id == cluster_id).then_some(ScopeEdit::Remove(scope.id))
        }
        Operation::Update => None,
    }
}

/// `INSERT INTO t (c1, c2, ...) VALUES (?1, ?2, ...)` over the row's columns.
pub fn build_insert_sql(table: &str, row: &Row) -> (String, Vec<SqlValue>) {
    let columns: Vec<String> = row.keys().map(|c| quote_ident(c)).collect();
    let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{i}")).collect();
    let values = row.values().map(SqlValue::from).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        columns.join(", "),
        placeholders.join(", ")
    );
    (sql, values)
}

/// `UPDATE t SET c1=?1, ... WHERE pk1=?n AND ...`.
///
/// Key values come from the old row, falling back to the new row.
pub fn build_update_sql(
    info: &TableInfo,
    old_row: Option<&Row>,
    new_row: &Row,
) -> SyncResult<(String, Vec<SqlValue>)> {
    if info.primary_keys.is_empty() {
        return Err(SyncError::MissingPrimaryKey {
            table: info.name.clone(),
        });
    }
    let mut values: Vec<SqlValue> = Vec::with_capacity(new_row.len() + info.primary_keys.len());
    let mut assignments = Vec::with_capacity(new_row.len());
    for (column, value) in new_row {
        values.push(SqlValue::from(value));
        assignments.push(format!("{}=?{}", quote_ident(column), values.len()));
    }

    let mut conditions = Vec::with_capacity(info.primary_keys.len());
    for key in &info.primary_keys {
        let value = old_row
            .and_then(|row| row.get(key))
            .or_else(|| new_row.get(key))
            .ok_or_else(|| SyncError::MissingPrimaryKey {
                table: info.name.clone(),
            })?;
        values.push(SqlValue::from(value));
        conditions.push(format!("{}=?{}", quote_ident(key), values.len()));
    }

    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        quote_ident(&info.name),
        assignments.join(", "),
        conditions.join(" AND ")
    );
    Ok((sql, values))
}

/// `DELETE FROM t WHERE pk1=?1 AND ...` with key values from the old row.
pub fn build_delete_sql(info: &TableInfo, old_row: &Row) -> SyncResult<(String, Vec<SqlValue>)> {
    if info.primary_keys.is_empty() {
        return Err(SyncError::MissingPrimaryKey {
            table: info.name.clone(),
        });
    }
    let mut values = Vec::with_capacity(info.primary_keys.len());
    let mut conditions = Vec::with_capacity(info.primary_keys.len());
    for key in &info.primary_keys {
        let value = old_row
            .get(key)
            .ok_or_else(|| SyncError::MissingPrimaryKey {
                table: info.name.clone(),
            })?;
        values.push(SqlValue::from(value));
        conditions.push(format!("{}=?{}", quote_ident(key), values.len()));
    }
    let sql = format!(
        "DELETE FROM {} WHERE {}",
        quote_ident(&info.name),
        conditions.join(" AND ")
    );
    Ok((sql, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::InstanceIdentity;
    use cdcsync_protocol::text_row;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const APP_TABLE: &str = "kms.app";

    struct Fixture {
        _dir: TempDir,
        store: Arc<LocalStore>,
        cache: ScopeCache,
        applier: ChangeApplier,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(dir.path()).await.unwrap());
        let generation = store.open_generation("snap-1").await.unwrap();
        for ddl in [
            "CREATE TABLE kms_app (id TEXT PRIMARY KEY, name TEXT, status TEXT)",
            "CREATE TABLE edgex_apid_cluster (id TEXT PRIMARY KEY, name TEXT)",
            "CREATE TABLE edgex_data_scope (id TEXT PRIMARY KEY, apid_cluster_id TEXT, scope TEXT, org TEXT, env TEXT)",
            "CREATE TABLE kms_nokey (name TEXT)",
        ] {
            sqlx::query(ddl).execute(&generation.pool).await.unwrap();
        }
        sqlx::query("INSERT INTO edgex_apid_cluster (id, name) VALUES ('c1', 'edge')")
            .execute(&generation.pool)
            .await
            .unwrap();
        store.ensure_sequence_column(&generation.pool).await.unwrap();
        store.switch_generation(generation).await;
        let cache = ScopeCache::spawn();
        let identity = InstanceIdentity::generate("edge", "c1").shared();
        let applier = ChangeApplier::new(store.clone(), cache.clone(), identity);
        Fixture {
            _dir: dir,
            store,
            cache,
            applier,
        }
    }

    fn batch(changes: Vec<Change>) -> ChangeList {
        ChangeList::new("", "1", changes)
    }

    fn app(id: &str, name: &str) -> Row {
        text_row([("id", id), ("name", name), ("status", "active")])
    }

    async fn count(f: &Fixture, table: &str) -> i64 {
        let pool = f.store.current_pool().unwrap();
        sqlx::query_scalar(&format!("SELECT count(*) FROM {table}"))
            .fetch_one(&pool)
            .await
            .unwrap()
    }

    #[test]
    fn insert_sql_lists_sorted_columns() {
        let (sql, values) = build_insert_sql("kms_app", &app("a1", "first"));
        assert_eq!(
            sql,
            "INSERT INTO \"kms_app\" (\"id\", \"name\", \"status\") VALUES (?1, ?2, ?3)"
        );
        assert_eq!(values[0], SqlValue::Text("a1".into()));
    }

    #[test]
    fn update_sql_keys_from_old_row() {
        let info = TableInfo {
            name: "kms_app".into(),
            columns: vec!["id".into(), "name".into()],
            primary_keys: vec!["id".into()],
        };
        let old = text_row([("id", "old-id")]);
        let new = text_row([("id", "new-id"), ("name", "n")]);
        let (sql, values) = build_update_sql(&info, Some(&old), &new).unwrap();
        assert_eq!(sql, "UPDATE \"kms_app\" SET \"id\"=?1, \"name\"=?2 WHERE \"id\"=?3");
        assert_eq!(values[2], SqlValue::Text("old-id".into()));

        let (_, values) = build_update_sql(&info, None, &new).unwrap();
        assert_eq!(values[2], SqlValue::Text("new-id".into()));
    }

    #[test]
    fn delete_sql_requires_keys() {
        let info = TableInfo {
            name: "kms_nokey".into(),
            columns: vec!["name".into()],
            primary_keys: Vec::new(),
        };
        assert!(matches!(
            build_delete_sql(&info, &text_row([("name", "x")])),
            Err(SyncError::MissingPrimaryKey { .. })
        ));
    }

    #[tokio::test]
    async fn insert_then_update_leaves_one_row() {
        let f = fixture().await;
        f.applier
            .apply(&batch(vec![Change::insert(APP_TABLE, app("a1", "first"))]))
            .await
            .unwrap();
        f.applier
            .apply(&batch(vec![Change::update(
                APP_TABLE,
                app("a1", "first"),
                app("a1", "second"),
            )]))
            .await
            .unwrap();

        assert_eq!(count(&f, "kms_app").await, 1);
        let pool = f.store.current_pool().unwrap();
        let name: String = sqlx::query_scalar("SELECT name FROM kms_app WHERE id = 'a1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(name, "second");
    }

    async fn stored_sequence(f: &Fixture) -> String {
        let pool = f.store.current_pool().unwrap();
        f.store.last_sequence(&pool).await.unwrap()
    }

    #[tokio::test]
    async fn cursor_commits_with_batch() {
        let f = fixture().await;
        f.applier
            .apply(&ChangeList::new(
                "",
                "7",
                vec![Change::insert(APP_TABLE, app("a1", "x"))],
            ))
            .await
            .unwrap();
        assert_eq!(stored_sequence(&f).await, "7");

        let result = f
            .applier
            .apply(&ChangeList::new(
                "7",
                "8",
                vec![
                    Change::insert(APP_TABLE, app("a2", "x")),
                    Change::delete(APP_TABLE, app("missing", "x")),
                ],
            ))
            .await;
        assert!(result.is_err());
        assert_eq!(stored_sequence(&f).await, "7");
        assert_eq!(count(&f, "kms_app").await, 1);
    }

    #[tokio::test]
    async fn delete_one_of_many() {
        let f = fixture().await;
        let inserts = (0..5)
            .map(|i| Change::insert(APP_TABLE, app(&format!("a{i}"), "x")))
            .collect();
        f.applier.apply(&batch(inserts)).await.unwrap();
        f.applier
            .apply(&batch(vec![Change::delete(APP_TABLE, app("a2", "x"))]))
            .await
            .unwrap();
        assert_eq!(count(&f, "kms_app").await, 4);
    }

    #[tokio::test]
    async fn deleting_absent_row_fails_batch() {
        let f = fixture().await;
        let result = f
            .applier
            .apply(&batch(vec![
                Change::insert(APP_TABLE, app("a1", "x")),
                Change::delete(APP_TABLE, app("missing", "x")),
            ]))
            .await;
        assert!(matches!(result, Err(SyncError::RowNotFound { .. })));
        assert_eq!(count(&f, "kms_app").await, 0);
    }

    #[tokio::test]
    async fn one_bad_record_rolls_back_batch() {
        let f = fixture().await;
        let bad = text_row([("id", "a2"), ("no_such_column", "x")]);
        let result = f
            .applier
            .apply(&batch(vec![
                Change::insert(APP_TABLE, app("a1", "x")),
                Change::insert(APP_TABLE, bad),
            ]))
            .await;
        assert!(matches!(result, Err(SyncError::Database(_))));
        assert_eq!(count(&f, "kms_app").await, 0);
    }

    #[tokio::test]
    async fn duplicate_insert_rolls_back_batch() {
        let f = fixture().await;
        let result = f
            .applier
            .apply(&batch(vec![
                Change::insert(APP_TABLE, app("a1", "x")),
                Change::insert(APP_TABLE, app("a1", "y")),
            ]))
            .await;
        assert!(result.is_err());
        assert_eq!(count(&f, "kms_app").await, 0);
    }

    #[tokio::test]
    async fn table_without_key_cannot_delete() {
        let f = fixture().await;
        let row = text_row([("name", "x")]);
        f.applier
            .apply(&batch(vec![Change::insert("kms.nokey", row.clone())]))
            .await
            .unwrap();
        let result = f
            .applier
            .apply(&batch(vec![Change::delete("kms.nokey", row)]))
            .await;
        assert!(matches!(result, Err(SyncError::MissingPrimaryKey { .. })));
    }

    #[tokio::test]
    async fn privileged_tables_reject_writes() {
        let f = fixture().await;
        let cluster = text_row([("id", "c1"), ("name", "n")]);
        for change in [
            Change::insert(CLUSTER_TABLE, cluster.clone()),
            Change::update(CLUSTER_TABLE, cluster.clone(), cluster.clone()),
            Change::update(DATA_SCOPE_TABLE, cluster.clone(), cluster.clone()),
        ] {
            let err = f.applier.apply(&batch(vec![change])).await.unwrap_err();
            assert!(matches!(err, SyncError::IllegalTableOperation { .. }));
            assert!(err.is_fatal());
        }
    }

    #[tokio::test]
    async fn missing_row_is_reported() {
        let f = fixture().await;
        let mut change = Change::insert(APP_TABLE, app("a1", "x"));
        change.new_row = None;
        let err = f.applier.apply(&batch(vec![change])).await.unwrap_err();
        assert!(matches!(err, SyncError::MissingRow { .. }));
    }

    #[tokio::test]
    async fn data_scope_changes_update_cache() {
        let f = fixture().await;
        let mine = text_row([("id", "s1"), ("apid_cluster_id", "c1"), ("scope", "ert452")]);
        let other = text_row([("id", "s2"), ("apid_cluster_id", "c9"), ("scope", "foreign")]);
        f.applier
            .apply(&batch(vec![
                Change::insert(DATA_SCOPE_TABLE, mine.clone()),
                Change::insert(DATA_SCOPE_TABLE, other),
            ]))
            .await
            .unwrap();
        assert_eq!(f.cache.read_all().await.unwrap(), vec!["ert452"]);
        assert_eq!(count(&f, "edgex_data_scope").await, 2);

        f.applier
            .apply(&batch(vec![Change::delete(DATA_SCOPE_TABLE, mine)]))
            .await
            .unwrap();
        assert!(f.cache.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscriber_acknowledges_with_result() {
        let f = fixture().await;
        let bus = EventBus::new();
        let applier = Arc::new(f.applier);
        let handle = applier.clone().spawn_subscriber(&bus);

        let ok = ChangeList::new("", "1", vec![Change::insert(APP_TABLE, app("a1", "x"))]);
        bus.publish(
            SyncEvent::Changes(Arc::new(ok)),
            std::time::Duration::from_secs(5),
        )
        .await
        .unwrap();

        let bad = ChangeList::new("", "2", vec![Change::delete(APP_TABLE, app("zz", "x"))]);
        let err = bus
            .publish(
                SyncEvent::Changes(Arc::new(bad)),
                std::time::Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RowNotFound { .. }));
        handle.abort();
    }
}

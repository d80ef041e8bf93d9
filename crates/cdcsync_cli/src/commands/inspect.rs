//! Inspect command implementation.

use cdcsync_engine::{quote_ident, LocalStore, DEFAULT_DB_FILE};
use serde::Serialize;
use std::path::Path;

/// Data directory inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Data directory.
    pub data_dir: String,
    /// Instance id, if an identity has been created.
    pub instance_id: Option<String>,
    /// Cluster the identity belongs to.
    pub cluster_id: Option<String>,
    /// Last applied snapshot.
    pub last_snapshot: Option<String>,
    /// Whether the snapshot's generation is on disk.
    pub snapshot_present: bool,
    /// Change cursor stored in the snapshot.
    pub last_sequence: Option<String>,
    /// Scopes recorded for the cluster.
    pub scopes: Vec<String>,
    /// Known-tables set.
    pub known_tables: Vec<String>,
    /// Row counts (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<TableStats>>,
}

/// Row count of one replicated table.
#[derive(Debug, Serialize)]
pub struct TableStats {
    /// Local table name.
    pub name: String,
    /// Number of rows.
    pub rows: i64,
}

/// Runs the inspect command.
pub async fn run(
    data_dir: &Path,
    show_tables: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(data_dir, show_tables).await?;
    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }
    Ok(())
}

/// Collects the state of `data_dir` without modifying it.
pub async fn inspect(
    data_dir: &Path,
    show_tables: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    if !data_dir.join(DEFAULT_DB_FILE).exists() {
        return Err(format!("No cdcsync data found at {:?}", data_dir).into());
    }
    let store = LocalStore::open(data_dir).await?;
    let identity = store.saved_identity().await?;
    let known_tables = store
        .known_tables()
        .await?
        .iter()
        .map(str::to_string)
        .collect();

    let mut result = InspectResult {
        data_dir: data_dir.display().to_string(),
        instance_id: identity.as_ref().map(|i| i.instance_id.clone()),
        cluster_id: identity.as_ref().map(|i| i.cluster_id.clone()),
        last_snapshot: identity
            .as_ref()
            .filter(|i| i.has_snapshot())
            .map(|i| i.last_snapshot.clone()),
        snapshot_present: false,
        last_sequence: None,
        scopes: Vec::new(),
        known_tables,
        tables: None,
    };

    if let (Some(identity), Some(snapshot)) = (&identity, &result.last_snapshot) {
        if store.generation_exists(snapshot) {
            let generation = store.open_generation(snapshot).await?;
            let pool = generation.pool.clone();
            result.snapshot_present = true;
            result.last_sequence = Some(store.last_sequence(&pool).await?);
            result.scopes = store.find_scopes(&pool, &identity.cluster_id).await?;
            if show_tables {
                let mut tables = Vec::new();
                for name in store.introspect_tables(&pool).await?.iter() {
                    let rows: i64 =
                        sqlx::query_scalar(&format!("SELECT count(*) FROM {}", quote_ident(name)))
                            .fetch_one(&pool)
                            .await?;
                    tables.push(TableStats {
                        name: name.to_string(),
                        rows,
                    });
                }
                result.tables = Some(tables);
            }
            pool.close().await;
        }
    }
    store.close().await;
    Ok(result)
}

fn print_text_output(result: &InspectResult) {
    let or_none = |value: &Option<String>| value.clone().unwrap_or_else(|| "(none)".into());
    println!("Data directory: {}", result.data_dir);
    println!("Instance id:    {}", or_none(&result.instance_id));
    println!("Cluster id:     {}", or_none(&result.cluster_id));
    println!(
        "Last snapshot:  {}{}",
        or_none(&result.last_snapshot),
        if result.last_snapshot.is_some() && !result.snapshot_present {
            " (missing on disk)"
        } else {
            ""
        }
    );
    println!("Last sequence:  {}", or_none(&result.last_sequence));
    println!("Scopes:         {}", result.scopes.join(", "));
    println!("Known tables:   {}", result.known_tables.len());
    for table in &result.known_tables {
        println!("  {table}");
    }
    if let Some(tables) = &result.tables {
        println!();
        println!("{:<40} {:>10}", "Table", "Rows");
        for table in tables {
            println!("{:<40} {:>10}", table.name, table.rows);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdcsync_protocol::KnownTables;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_data_dir_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(inspect(dir.path(), false).await.is_err());
    }

    #[tokio::test]
    async fn reports_snapshot_state() {
        let dir = TempDir::new().unwrap();
        {
            let store = LocalStore::open(dir.path()).await.unwrap();
            let mut identity = store.load_or_create_identity("edge", "c1").await.unwrap();
            let generation = store.open_generation("snap-1").await.unwrap();
            for sql in [
                "CREATE TABLE edgex_apid_cluster (id TEXT PRIMARY KEY, last_sequence TEXT)",
                "INSERT INTO edgex_apid_cluster VALUES ('c1', '42.0.1')",
                "CREATE TABLE edgex_data_scope (id TEXT PRIMARY KEY, apid_cluster_id TEXT, scope TEXT)",
                "INSERT INTO edgex_data_scope VALUES ('s1', 'c1', 'scope-a')",
            ] {
                sqlx::query(sql).execute(&generation.pool).await.unwrap();
            }
            generation.pool.close().await;
            identity.last_snapshot = "snap-1".into();
            store.save_identity(&identity).await.unwrap();
            store
                .replace_known_tables(&KnownTables::from_names([
                    "edgex_apid_cluster",
                    "edgex_data_scope",
                ]))
                .await
                .unwrap();
            store.close().await;
        }

        let result = inspect(dir.path(), true).await.unwrap();
        assert_eq!(result.cluster_id.as_deref(), Some("c1"));
        assert_eq!(result.last_snapshot.as_deref(), Some("snap-1"));
        assert!(result.snapshot_present);
        assert_eq!(result.last_sequence.as_deref(), Some("42.0.1"));
        assert_eq!(result.scopes, vec!["scope-a"]);
        assert_eq!(result.known_tables.len(), 2);
        let tables = result.tables.unwrap();
        assert_eq!(tables.len(), 2);
        assert!(tables.iter().all(|t| t.rows == 1));
    }
}

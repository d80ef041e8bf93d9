//! In-memory cache of the data scopes assigned to this cluster.

use crate::error::{SyncError, SyncResult};
use cdcsync_protocol::Row;
use sqlx::sqlite::SqliteRow;
use sqlx::Row as _;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

const CHANNEL_CAPACITY: usize = 64;

/// One row of the data scope table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataScope {
    /// Unique id.
    pub id: String,
    /// Cluster the scope is assigned to.
    pub cluster_id: String,
    /// Scope name sent to the snapshot and change services.
    pub scope: String,
    /// Organization.
    pub org: String,
    /// Environment.
    pub env: String,
    /// Creation time.
    pub created: String,
    /// Creator.
    pub created_by: String,
    /// Last update time.
    pub updated: String,
    /// Last updater.
    pub updated_by: String,
}

impl DataScope {
    /// Reads a scope from a local table row. Missing or null columns are empty.
    pub fn from_sql_row(row: &SqliteRow) -> Self {
        let get = |column: &str| -> String {
            row.try_get::<Option<String>, _>(column)
                .ok()
                .flatten()
                .unwrap_or_default()
        };
        Self {
            id: get("id"),
            cluster_id: get("apid_cluster_id"),
            scope: get("scope"),
            org: get("org"),
            env: get("env"),
            created: get("created"),
            created_by: get("created_by"),
            updated: get("updated"),
            updated_by: get("updated_by"),
        }
    }

    /// Reads a scope from a change record row.
    pub fn from_change_row(row: &Row) -> Self {
        let get = |column: &str| -> String {
            row.get(column)
                .and_then(|value| value.as_text())
                .unwrap_or_default()
        };
        Self {
            id: get("id"),
            cluster_id: get("apid_cluster_id"),
            scope: get("scope"),
            org: get("org"),
            env: get("env"),
            created: get("created"),
            created_by: get("created_by"),
            updated: get("updated"),
            updated_by: get("updated_by"),
        }
    }
}

enum Request {
    ReadAll(oneshot::Sender<Vec<String>>),
    Update(DataScope, oneshot::Sender<()>),
    Remove(String, oneshot::Sender<()>),
    ClearAndInit(String, oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Handle to the scope cache actor.
///
/// Every call waits for the actor to acknowledge it, so a read issued after
/// a write from any handle observes that write.
#[derive(Clone)]
pub struct ScopeCache {
    tx: mpsc::Sender<Request>,
}

impl ScopeCache {
    /// Spawns the actor and returns a handle to it.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(run(rx));
        Self { tx }
    }

    /// Distinct scope names currently cached, sorted.
    pub async fn read_all(&self) -> SyncResult<Vec<String>> {
        let (ack, rx) = oneshot::channel();
        self.send(Request::ReadAll(ack)).await?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    /// Inserts or replaces a scope, keyed by id.
    pub async fn update(&self, scope: DataScope) -> SyncResult<()> {
        let (ack, rx) = oneshot::channel();
        self.send(Request::Update(scope, ack)).await?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    /// Removes a scope by id.
    pub async fn remove(&self, id: impl Into<String>) -> SyncResult<()> {
        let (ack, rx) = oneshot::channel();
        self.send(Request::Remove(id.into(), ack)).await?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    /// Empties the cache if `version` differs from the one it holds.
    pub async fn clear_and_init(&self, version: impl Into<String>) -> SyncResult<()> {
        let (ack, rx) = oneshot::channel();
        self.send(Request::ClearAndInit(version.into(), ack)).await?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    /// Stops the actor. Later calls on any handle return `Closed`.
    pub async fn close(&self) -> SyncResult<()> {
        let (ack, rx) = oneshot::channel();
        self.send(Request::Close(ack)).await?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    async fn send(&self, request: Request) -> SyncResult<()> {
        self.tx.send(request).await.map_err(|_| SyncError::Closed)
    }
}

async fn run(mut rx: mpsc::Receiver<Request>) {
    let mut scopes: HashMap<String, DataScope> = HashMap::new();
    let mut version = String::new();

    while let Some(request) = rx.recv().await {
        match request {
            Request::ReadAll(ack) => {
                let names: BTreeSet<String> = scopes.values().map(|s| s.scope.clone()).collect();
                let _ = ack.send(names.into_iter().collect());
            }
            Request::Update(scope, ack) => {
                debug!(id = %scope.id, scope = %scope.scope, "caching data scope");
                scopes.insert(scope.id.clone(), scope);
                let _ = ack.send(());
            }
            Request::Remove(id, ack) => {
                debug!(id = %id, "evicting data scope");
                scopes.remove(&id);
                let _ = ack.send(());
            }
            Request::ClearAndInit(new_version, ack) => {
                if new_version != version {
                    debug!(version = %new_version, "resetting scope cache");
                    scopes.clear();
                    version = new_version;
                }
                let _ = ack.send(());
            }
            Request::Close(ack) => {
                rx.close();
                let _ = ack.send(());
                break;
            }
        }
    }
    debug!("scope cache stopped");
}

//! Full-state snapshot download and activation.

use crate::backoff::Backoff;
use crate::config::{SnapshotProtocol, SyncConfig};
use crate::credential::TokenSource;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::http::{endpoint, unexpected_status, SyncHttpClient};
use crate::retry::retry_until_success;
use crate::scope_cache::ScopeCache;
use crate::store::{open_database, Generation, LocalStore, BOOTSTRAP_GENERATION};
use cdcsync_protocol::{headers, Snapshot};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A downloaded snapshot and the generation holding it.
#[derive(Debug, Clone)]
pub struct DownloadedSnapshot {
    /// Snapshot metadata. Table-less for binary downloads.
    pub snapshot: Snapshot,
    /// Generation database the snapshot was written to. Not yet current.
    pub generation: Generation,
}

/// Downloads snapshots and makes them the current generation.
///
/// Downloads are serialized: at most one is in flight at a time, and
/// `close` waits for it to finish.
pub struct SnapshotManager {
    config: Arc<SyncConfig>,
    http: Arc<SyncHttpClient>,
    tokens: Arc<dyn TokenSource>,
    store: Arc<LocalStore>,
    cache: ScopeCache,
    bus: EventBus,
    download_lock: Mutex<()>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl SnapshotManager {
    /// Creates a snapshot manager.
    pub fn new(
        config: Arc<SyncConfig>,
        http: Arc<SyncHttpClient>,
        tokens: Arc<dyn TokenSource>,
        store: Arc<LocalStore>,
        cache: ScopeCache,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            http,
            tokens,
            store,
            cache,
            bus,
            download_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn cluster_id(&self) -> String {
        self.http.identity().read().cluster_id.clone()
    }

    /// Downloads a snapshot of `scopes`, retrying until it succeeds.
    ///
    /// The result is written to its own generation but not activated.
    pub async fn download_snapshot(
        &self,
        scopes: &[String],
        is_boot: bool,
    ) -> SyncResult<DownloadedSnapshot> {
        let _guard = self.download_lock.lock().await;
        self.fetch(scopes, is_boot).await
    }

    /// Downloads the cluster's boot snapshot and activates it.
    ///
    /// The boot snapshot only carries cluster-level tables; it seeds the
    /// scope cache so the data snapshot knows what to ask for. Subscribers
    /// are not notified.
    pub async fn download_boot_snapshot(&self) -> SyncResult<()> {
        let _guard = self.download_lock.lock().await;
        let cluster_id = self.cluster_id();
        info!(cluster = %cluster_id, "downloading boot snapshot");

        let downloaded = self.fetch(&[cluster_id.clone()], true).await?;
        let pool = downloaded.generation.pool.clone();
        self.store.switch_generation(downloaded.generation).await;
        self.reload_scope_cache(&pool, BOOTSTRAP_GENERATION, &cluster_id)
            .await
    }

    /// Downloads a snapshot of every known scope and activates it.
    pub async fn download_data_snapshot(&self) -> SyncResult<()> {
        let _guard = self.download_lock.lock().await;
        let cluster_id = self.cluster_id();
        let mut scopes = self.cache.read_all().await?;
        scopes.push(cluster_id);
        info!(scopes = ?scopes, "downloading data snapshot");

        let downloaded = self.fetch(&scopes, false).await?;
        self.activate(downloaded.snapshot, downloaded.generation).await
    }

    /// Activates a snapshot whose generation already exists on disk.
    pub async fn start_on_data_snapshot(&self, snapshot: Snapshot) -> SyncResult<()> {
        let _guard = self.download_lock.lock().await;
        let generation = self.existing_generation(&snapshot.snapshot_info).await?;
        self.activate(snapshot, generation).await
    }

    /// Resumes from a previously applied snapshot without network I/O.
    pub async fn start_on_local_snapshot(&self, id: &str) -> SyncResult<()> {
        let _guard = self.download_lock.lock().await;
        info!(snapshot = %id, "starting on local snapshot");
        let generation = self.existing_generation(id).await?;
        self.activate(Snapshot::local(id), generation).await
    }

    /// Cancels any download in progress and waits for it to stop.
    pub async fn close(&self) -> SyncResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        debug!("closing snapshot manager");
        self.cancel.cancel();
        let _guard = self.download_lock.lock().await;
        Ok(())
    }

    async fn existing_generation(&self, id: &str) -> SyncResult<Generation> {
        if !self.store.generation_exists(id) {
            return Err(SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("snapshot generation {id} not found"),
            )));
        }
        self.store.open_generation(id).await
    }

    /// Makes a downloaded or local snapshot current and announces it.
    async fn activate(&self, snapshot: Snapshot, generation: Generation) -> SyncResult<()> {
        let id = generation.id.clone();
        let pool = generation.pool.clone();
        let cluster_id = self.cluster_id();

        let known = if snapshot.is_sentinel() {
            self.store.introspect_tables(&pool).await?
        } else {
            snapshot.known_tables()
        };
        self.store.ensure_sequence_column(&pool).await?;

        let mut identity = self.http.identity().read().clone();
        identity.last_snapshot = id.clone();
        self.store.save_identity(&identity).await?;
        self.http.identity().write().last_snapshot = id.clone();

        self.store.replace_known_tables(&known).await?;

        self.store.switch_generation(generation).await;
        self.reload_scope_cache(&pool, &id, &cluster_id).await?;
        info!(snapshot = %id, tables = known.len(), "snapshot is current");

        let snapshot = Snapshot {
            snapshot_info: id,
            ..snapshot
        };
        self.bus
            .publish(SyncEvent::Snapshot(Arc::new(snapshot)), self.config.publish_timeout)
            .await
    }

    async fn reload_scope_cache(
        &self,
        pool: &sqlx::SqlitePool,
        version: &str,
        cluster_id: &str,
    ) -> SyncResult<()> {
        self.cache.clear_and_init(version).await?;
        for scope in self.store.load_data_scopes(pool, cluster_id).await? {
            self.cache.update(scope).await?;
        }
        Ok(())
    }

    async fn fetch(&self, scopes: &[String], is_boot: bool) -> SyncResult<DownloadedSnapshot> {
        retry_until_success(
            &self.cancel,
            Backoff::from_config(&self.config.backoff),
            || self.attempt_download(scopes, is_boot),
            |err| error!(error = %err, "snapshot download failed"),
        )
        .await
    }

    async fn attempt_download(
        &self,
        scopes: &[String],
        is_boot: bool,
    ) -> SyncResult<DownloadedSnapshot> {
        let token = self.tokens.bearer_token().await?;
        let url = endpoint(&self.config.snapshot_base_uri, "snapshots");
        let query: Vec<(&str, &str)> = scopes.iter().map(|s| ("scope", s.as_str())).collect();
        let protocol = self.config.snapshot_protocol;
        debug!(url = %url, ?protocol, "requesting snapshot");

        let mut response = self
            .http
            .authorized_get(&url, &token)
            .query(&query)
            .header(ACCEPT, protocol.media_type())
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => {
                self.tokens.invalidate().await?;
                return Err(SyncError::AuthenticationFailed(
                    "snapshot server rejected token".into(),
                ));
            }
            _ => return Err(unexpected_status(response).await),
        }

        let header_id = response
            .headers()
            .get(headers::SNAPSHOT_TXID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let scratch = self.store.scratch_path();

        let result = match protocol {
            SnapshotProtocol::Sqlite => {
                let id = if is_boot {
                    BOOTSTRAP_GENERATION.to_string()
                } else {
                    header_id.ok_or_else(|| {
                        SyncError::MalformedResponse(format!(
                            "missing {} header",
                            headers::SNAPSHOT_TXID
                        ))
                    })?
                };
                info!(snapshot = %id, "streaming binary snapshot");
                let mut file = tokio::fs::File::create(&scratch).await?;
                let mut written = 0usize;
                let streamed: SyncResult<()> = async {
                    while let Some(chunk) = response.chunk().await? {
                        written += chunk.len();
                        file.write_all(&chunk).await?;
                    }
                    file.sync_all().await?;
                    Ok(())
                }
                .await;
                drop(file);
                match streamed {
                    Ok(()) => {
                        debug!(bytes = written, "snapshot stream complete");
                        self.install(&id, &scratch, Snapshot::local(id.clone())).await
                    }
                    Err(err) => Err(err),
                }
            }
            SnapshotProtocol::Json => {
                let body = response.bytes().await?;
                let mut snapshot = Snapshot::decode(&body)?;
                let id = if is_boot {
                    BOOTSTRAP_GENERATION.to_string()
                } else if !snapshot.snapshot_info.is_empty() {
                    snapshot.snapshot_info.clone()
                } else {
                    header_id.ok_or_else(|| {
                        SyncError::MalformedResponse("snapshot has no id".into())
                    })?
                };
                snapshot.snapshot_info = id.clone();
                info!(
                    snapshot = %id,
                    tables = snapshot.tables.len(),
                    "ingesting structured snapshot"
                );
                let pool = open_database(&scratch).await?;
                let ingested = self.store.ingest_snapshot(&pool, &snapshot).await;
                pool.close().await;
                match ingested {
                    Ok(()) => self.install(&id, &scratch, snapshot).await,
                    Err(err) => Err(err),
                }
            }
        };

        if result.is_err() {
            if let Err(err) = tokio::fs::remove_file(&scratch).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        path = %scratch.display(),
                        error = %err,
                        "failed to remove partial snapshot"
                    );
                }
            }
        }
        result
    }

    async fn install(
        &self,
        id: &str,
        scratch: &Path,
        snapshot: Snapshot,
    ) -> SyncResult<DownloadedSnapshot> {
        let generation = self.store.install_generation_file(id, scratch).await?;
        Ok(DownloadedSnapshot {
            snapshot,
            generation,
        })
    }
}

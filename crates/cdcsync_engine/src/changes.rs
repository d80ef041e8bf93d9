//! Long-polling of the change feed.

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::credential::TokenSource;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::http::{endpoint, unexpected_status, SyncHttpClient};
use crate::retry::retry_until_success;
use crate::scope_cache::ScopeCache;
use crate::snapshot::SnapshotManager;
use crate::store::LocalStore;
use cdcsync_protocol::{ChangeList, ChangeServerError};
use reqwest::StatusCode;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one request to the change server.
#[derive(Debug)]
enum PollOutcome {
    /// A batch arrived.
    Changes(ChangeList),
    /// Nothing new within the block interval.
    NotModified,
}

/// Polls the change server and publishes validated batches.
///
/// Exactly one request is outstanding at a time, and the next one is not
/// issued until subscribers have acknowledged the previous batch.
pub struct ChangePoller {
    config: Arc<SyncConfig>,
    http: Arc<SyncHttpClient>,
    tokens: Arc<dyn TokenSource>,
    store: Arc<LocalStore>,
    cache: ScopeCache,
    bus: EventBus,
    snapshots: Arc<SnapshotManager>,
    cancel: CancellationToken,
    launched: AtomicBool,
    closed: AtomicBool,
    done_tx: watch::Sender<bool>,
}

impl ChangePoller {
    /// Creates a poller.
    pub fn new(
        config: Arc<SyncConfig>,
        http: Arc<SyncHttpClient>,
        tokens: Arc<dyn TokenSource>,
        store: Arc<LocalStore>,
        cache: ScopeCache,
        bus: EventBus,
        snapshots: Arc<SnapshotManager>,
    ) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            config,
            http,
            tokens,
            store,
            cache,
            bus,
            snapshots,
            cancel: CancellationToken::new(),
            launched: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            done_tx,
        }
    }

    /// Polls until cancelled or a fatal error occurs.
    ///
    /// May be called once; a second call fails with `InvalidStateTransition`.
    /// Schema drift downloads a fresh data snapshot before polling resumes.
    pub async fn poll(&self) -> SyncResult<()> {
        if self.launched.swap(true, Ordering::SeqCst) {
            return Err(SyncError::InvalidStateTransition {
                from: "polling".into(),
                to: "polling".into(),
            });
        }
        info!("change polling started");
        let result = retry_until_success(
            &self.cancel,
            Backoff::from_config(&self.config.backoff),
            || self.poll_agent(),
            |err| error!(error = %err, "change polling failed"),
        )
        .await;
        self.done_tx.send_replace(true);
        match result {
            Err(SyncError::Cancelled) | Err(SyncError::Closed) => {
                info!("change polling stopped");
                Ok(())
            }
            other => other,
        }
    }

    /// Stops polling and waits until the polling loop has exited.
    pub async fn close(&self) -> SyncResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        debug!("closing change poller");
        self.cancel.cancel();
        if self.launched.load(Ordering::SeqCst) {
            let mut done = self.done_tx.subscribe();
            let _ = done.wait_for(|finished| *finished).await;
        }
        Ok(())
    }

    /// One polling session: runs cycles until one fails.
    async fn poll_agent(&self) -> SyncResult<()> {
        let result = self.poll_cycles().await;
        if let Err(err) = &result {
            if err.is_schema_drift() && !self.cancel.is_cancelled() {
                warn!(reason = %err, "schema drift, fetching a new snapshot");
                self.snapshots.download_data_snapshot().await?;
            }
        }
        result
    }

    async fn poll_cycles(&self) -> SyncResult<()> {
        let mut sequence = self.store.last_sequence(&self.store.current_pool()?).await?;
        debug!(sequence = %sequence, "loaded change cursor");
        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let scopes = self.cache.read_all().await?;
            let outcome = self.get_changes(&sequence, &scopes).await?;
            if let PollOutcome::Changes(changes) = outcome {
                self.handle_changes(&mut sequence, &scopes, changes).await?;
            }
        }
    }

    async fn get_changes(&self, since: &str, scopes: &[String]) -> SyncResult<PollOutcome> {
        let token = self.tokens.bearer_token().await?;
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let (cluster_id, snapshot) = {
            let identity = self.http.identity().read();
            (identity.cluster_id.clone(), identity.last_snapshot.clone())
        };
        let url = endpoint(&self.config.change_base_uri, "changes");
        let query = change_query(
            since,
            self.config.long_poll_block,
            scopes,
            &cluster_id,
            &snapshot,
        );
        debug!(url = %url, since = %since, "polling for changes");

        let response = self
            .http
            .authorized_get(&url, &token)
            .query(&query)
            .send()
            .await
            .map_err(|e| {
                let err = SyncError::from(e);
                self.http.set_error(&err);
                err
            })?;

        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await?;
                self.http.clear_error();
                Ok(PollOutcome::Changes(ChangeList::decode(&body)?))
            }
            StatusCode::NOT_MODIFIED => {
                self.http.clear_error();
                Ok(PollOutcome::NotModified)
            }
            StatusCode::UNAUTHORIZED => {
                self.tokens.invalidate().await?;
                Err(SyncError::AuthenticationFailed(
                    "change server rejected token".into(),
                ))
            }
            StatusCode::BAD_REQUEST => {
                let body = response.bytes().await?;
                let server_error = ChangeServerError::decode(&body)?;
                if server_error.is_snapshot_too_old() {
                    Err(SyncError::SchemaDrift(server_error.code))
                } else {
                    Err(SyncError::UnexpectedStatus {
                        status: 400,
                        body: server_error.code,
                    })
                }
            }
            _ => Err(unexpected_status(response).await),
        }
    }

    async fn handle_changes(
        &self,
        sequence: &mut String,
        scopes_before: &[String],
        changes: ChangeList,
    ) -> SyncResult<()> {
        let known = self.store.known_tables().await?;
        if let Some(table) = changes.unknown_table(&known) {
            return Err(SyncError::SchemaDrift(format!("unknown table {table:?}")));
        }

        let last_sequence = changes.last_sequence.clone();
        let advanced = !last_sequence.is_empty() && *sequence != last_sequence;
        if !changes.is_empty() {
            info!(
                changes = changes.len(),
                last_sequence = %last_sequence,
                "publishing change batch"
            );
            // The applier stores the cursor in the batch transaction.
            self.bus
                .publish(
                    SyncEvent::Changes(Arc::new(changes)),
                    self.config.publish_timeout,
                )
                .await?;
        } else {
            debug!("empty change batch");
            if advanced {
                let pool = self.store.current_pool()?;
                self.store
                    .update_last_sequence(&pool, &last_sequence)
                    .await
                    .map_err(|e| SyncError::SequencePersistence(e.to_string()))?;
            }
        }

        if advanced {
            *sequence = last_sequence;
        }

        let scopes_after = self.cache.read_all().await?;
        if scopes_changed(scopes_before, &scopes_after) {
            return Err(SyncError::SchemaDrift(format!(
                "scopes changed from {scopes_before:?} to {scopes_after:?}"
            )));
        }
        Ok(())
    }
}

/// Query parameters for a change request.
///
/// Without a cursor the request omits `since` and does not block, so the
/// server answers at once with its current position.
fn change_query(
    since: &str,
    block: Duration,
    scopes: &[String],
    cluster_id: &str,
    snapshot: &str,
) -> Vec<(&'static str, String)> {
    let mut query = Vec::with_capacity(scopes.len() + 4);
    if since.is_empty() {
        query.push(("block", "0".to_string()));
    } else {
        query.push(("since", since.to_string()));
        query.push(("block", block.as_secs().to_string()));
    }
    for scope in scopes {
        query.push(("scope", scope.clone()));
    }
    query.push(("scope", cluster_id.to_string()));
    query.push(("snapshot", snapshot.to_string()));
    query
}

fn scopes_changed(before: &[String], after: &[String]) -> bool {
    let before: BTreeSet<&String> = before.iter().collect();
    let after: BTreeSet<&String> = after.iter().collect();
    before != after
}

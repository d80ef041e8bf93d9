//! Sync engine: wires the components together and drives the lifecycle.

use crate::applier::ChangeApplier;
use crate::changes::ChangePoller;
use crate::config::{SyncConfig, SyncMode};
use crate::credential::{CredentialManager, TokenSource};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::http::SyncHttpClient;
use crate::identity::SharedIdentity;
use crate::scope_cache::ScopeCache;
use crate::snapshot::SnapshotManager;
use crate::store::LocalStore;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Created, `run` not called yet.
    Idle,
    /// Activating a local snapshot or downloading boot and data snapshots.
    Bootstrapping,
    /// Following the change feed.
    Polling,
    /// Serving a local snapshot without contacting the remote services.
    Offline,
    /// Stopped by `close`.
    Closed,
    /// Stopped by a fatal error.
    Failed,
}

impl SyncState {
    /// Returns true while the engine is doing work.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Bootstrapping | SyncState::Polling | SyncState::Offline
        )
    }

    /// Returns true if `run` may be called.
    pub fn can_start(&self) -> bool {
        matches!(self, SyncState::Idle)
    }
}

/// Counters over events seen on the bus.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Snapshots made live.
    pub snapshots_delivered: u64,
    /// Non-empty change batches delivered to subscribers.
    pub batches_delivered: u64,
    /// Change records across all delivered batches.
    pub changes_delivered: u64,
    /// Id of the most recent live snapshot.
    pub last_snapshot: Option<String>,
    /// Cursor after the most recent delivered batch.
    pub last_sequence: Option<String>,
    /// When the last event was seen.
    pub last_event_at: Option<DateTime<Utc>>,
    /// Last fatal error.
    pub last_error: Option<String>,
}

/// The synchronization engine.
///
/// Owns every component for one data directory. `run` performs the
/// bootstrap and then polls until `close` is called or a fatal error
/// occurs.
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    store: Arc<LocalStore>,
    identity: SharedIdentity,
    http: Arc<SyncHttpClient>,
    credentials: Arc<CredentialManager>,
    cache: ScopeCache,
    bus: EventBus,
    snapshots: Arc<SnapshotManager>,
    poller: ChangePoller,
    subscribers: Mutex<Vec<JoinHandle<()>>>,
    state: RwLock<SyncState>,
    stats: Arc<RwLock<SyncStats>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl SyncEngine {
    /// Validates `config`, opens the data directory and starts the actors.
    ///
    /// Nothing is fetched until `run`.
    pub async fn new(config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let store = Arc::new(LocalStore::open(&config.data_dir).await?);
        let identity = store
            .load_or_create_identity(&config.instance_name, &config.cluster_id)
            .await?;
        info!(
            instance_id = %identity.instance_id,
            cluster = %identity.cluster_id,
            last_snapshot = %identity.last_snapshot,
            "loaded instance identity"
        );
        let identity = identity.shared();

        let http = Arc::new(SyncHttpClient::new(&config, identity.clone())?);
        let credentials = Arc::new(CredentialManager::spawn(
            &config,
            http.clone(),
            store.clone(),
        ));
        let tokens: Arc<dyn TokenSource> = credentials.clone();
        let cache = ScopeCache::spawn();
        let bus = EventBus::new();

        let snapshots = Arc::new(SnapshotManager::new(
            config.clone(),
            http.clone(),
            tokens.clone(),
            store.clone(),
            cache.clone(),
            bus.clone(),
        ));
        let poller = ChangePoller::new(
            config.clone(),
            http.clone(),
            tokens,
            store.clone(),
            cache.clone(),
            bus.clone(),
            snapshots.clone(),
        );

        let applier = Arc::new(ChangeApplier::new(
            store.clone(),
            cache.clone(),
            identity.clone(),
        ));
        let stats = Arc::new(RwLock::new(SyncStats::default()));
        let subscribers = vec![
            applier.spawn_subscriber(&bus),
            spawn_stats_subscriber(&bus, stats.clone()),
        ];

        Ok(Self {
            config,
            store,
            identity,
            http,
            credentials,
            cache,
            bus,
            snapshots,
            poller,
            subscribers: Mutex::new(subscribers),
            state: RwLock::new(SyncState::Idle),
            stats,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Snapshot of the event counters.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Configuration in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Shared instance identity.
    pub fn identity(&self) -> &SharedIdentity {
        &self.identity
    }

    /// Credential manager, for the local token endpoint.
    pub fn credentials(&self) -> Arc<CredentialManager> {
        self.credentials.clone()
    }

    /// Local databases.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Scope cache handle.
    pub fn scope_cache(&self) -> &ScopeCache {
        &self.cache
    }

    /// Event bus, for additional subscribers.
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Most recent error recorded by the HTTP layer or the engine.
    pub fn last_error(&self) -> Option<String> {
        self.http.last_error()
    }

    fn set_state(&self, state: SyncState) {
        debug!(?state, "engine state");
        *self.state.write() = state;
    }

    /// Bootstraps and polls until closed or a fatal error occurs.
    ///
    /// Resumes from the last applied snapshot when its generation is still
    /// on disk; otherwise downloads the boot snapshot and then the data
    /// snapshot. Returns `Ok` after `close`.
    pub async fn run(&self) -> SyncResult<()> {
        {
            let mut state = self.state.write();
            if !state.can_start() {
                return Err(SyncError::InvalidStateTransition {
                    from: format!("{:?}", *state),
                    to: "Bootstrapping".into(),
                });
            }
            *state = SyncState::Bootstrapping;
        }

        match self.bootstrap_and_poll().await {
            Ok(()) => Ok(()),
            Err(err) if err.is_shutdown() => {
                debug!("engine run interrupted by shutdown");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "sync engine failed");
                self.http.set_error(&err);
                self.stats.write().last_error = Some(err.to_string());
                self.set_state(SyncState::Failed);
                Err(err)
            }
        }
    }

    async fn bootstrap_and_poll(&self) -> SyncResult<()> {
        let last_snapshot = self.identity.read().last_snapshot.clone();
        let resumable =
            !last_snapshot.is_empty() && self.store.generation_exists(&last_snapshot);

        if resumable {
            self.snapshots.start_on_local_snapshot(&last_snapshot).await?;
        } else if self.config.mode == SyncMode::Offline {
            return Err(SyncError::InvalidConfig(
                "offline mode requires a local snapshot".into(),
            ));
        } else {
            if !last_snapshot.is_empty() {
                warn!(snapshot = %last_snapshot, "last snapshot missing on disk, bootstrapping");
            }
            self.snapshots.download_boot_snapshot().await?;
            self.snapshots.download_data_snapshot().await?;
        }

        if self.config.mode == SyncMode::Offline {
            self.set_state(SyncState::Offline);
            info!(snapshot = %last_snapshot, "serving local snapshot offline");
            self.cancel.cancelled().await;
            return Ok(());
        }

        self.set_state(SyncState::Polling);
        self.poller.poll().await
    }

    /// Stops every component in dependency order.
    ///
    /// Only the first call succeeds; later ones return `Closed`.
    pub async fn close(&self) -> SyncResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        info!("closing sync engine");
        self.cancel.cancel();

        log_close("change poller", self.poller.close().await);
        log_close("snapshot manager", self.snapshots.close().await);
        log_close("credential manager", self.credentials.close().await);
        for handle in self.subscribers.lock().drain(..) {
            handle.abort();
        }
        log_close("scope cache", self.cache.close().await);
        self.store.close().await;

        if self.state() != SyncState::Failed {
            self.set_state(SyncState::Closed);
        }
        Ok(())
    }
}

fn log_close(component: &str, result: SyncResult<()>) {
    match result {
        Ok(()) | Err(SyncError::Closed) => {}
        Err(err) => warn!(component, error = %err, "error while closing"),
    }
}

fn spawn_stats_subscriber(bus: &EventBus, stats: Arc<RwLock<SyncStats>>) -> JoinHandle<()> {
    let mut deliveries = bus.subscribe();
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            {
                let mut stats = stats.write();
                match &delivery.event {
                    SyncEvent::Snapshot(snapshot) => {
                        stats.snapshots_delivered += 1;
                        stats.last_snapshot = Some(snapshot.snapshot_info.clone());
                    }
                    SyncEvent::Changes(changes) => {
                        stats.batches_delivered += 1;
                        stats.changes_delivered += changes.len() as u64;
                        stats.last_sequence = Some(changes.last_sequence.clone());
                    }
                }
                stats.last_event_at = Some(Utc::now());
            }
            delivery.acknowledge(Ok(()));
        }
    })
}

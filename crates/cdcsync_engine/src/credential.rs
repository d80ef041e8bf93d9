//! Credential lifecycle: retrieval, scheduled refresh and invalidation.

use crate::backoff::Backoff;
use crate::config::{BackoffConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::http::{endpoint, now_rfc3339, unexpected_status, SyncHttpClient};
use crate::retry::retry_until_success;
use crate::store::LocalStore;
use async_trait::async_trait;
use cdcsync_protocol::{headers, AccessTokenResponse, Credential};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const REQUEST_CAPACITY: usize = 16;

/// Supplies bearer tokens to outbound requests.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns a currently valid bearer token.
    async fn bearer_token(&self) -> SyncResult<String>;

    /// Discards the current token and waits for a replacement.
    async fn invalidate(&self) -> SyncResult<()>;
}

/// Observable state of the credential manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    /// No credential has been retrieved yet.
    NoCredential,
    /// A valid credential is held.
    Valid,
    /// A retrieval is in progress.
    Refreshing,
}

enum Request {
    Get(oneshot::Sender<SyncResult<Credential>>),
    Invalidate(oneshot::Sender<SyncResult<()>>),
}

/// Owns the process's bearer credential.
///
/// A single actor task serializes token requests, invalidations and the
/// refresh timer, so at most one retrieval is ever in flight.
pub struct CredentialManager {
    tx: mpsc::Sender<Request>,
    credential: watch::Receiver<Option<Credential>>,
    state: watch::Receiver<CredentialState>,
    done: watch::Receiver<bool>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl CredentialManager {
    /// Spawns the credential actor.
    pub fn spawn(config: &SyncConfig, http: Arc<SyncHttpClient>, store: Arc<LocalStore>) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_CAPACITY);
        let (credential_tx, credential) = watch::channel(None);
        let (state_tx, state) = watch::channel(CredentialState::NoCredential);
        let (done_tx, done) = watch::channel(false);
        let cancel = CancellationToken::new();

        let actor = Actor {
            url: endpoint(&config.token_base_uri, "accesstoken"),
            consumer_key: config.consumer_key.clone(),
            consumer_secret: config.consumer_secret.clone(),
            plugin_details: config.plugin_details.clone(),
            refresh_margin: config.refresh_margin,
            backoff: config.backoff,
            http,
            store,
            cancel: cancel.clone(),
            current: None,
            retrievals: 0,
            credential_tx,
            state_tx,
        };
        tokio::spawn(async move {
            actor.run(rx).await;
            let _ = done_tx.send(true);
        });

        Self {
            tx,
            credential,
            state,
            done,
            cancel,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns a valid credential, retrieving one first if needed.
    pub async fn token(&self) -> SyncResult<Credential> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Request::Get(ack))
            .await
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    /// Watches the current credential.
    pub fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.credential.clone()
    }

    /// Current state.
    pub fn state(&self) -> CredentialState {
        *self.state.borrow()
    }

    /// Stops retries and the actor, then waits for it to exit.
    ///
    /// Only the first call succeeds; later ones return `Closed`.
    pub async fn close(&self) -> SyncResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        debug!("closing credential manager");
        self.cancel.cancel();
        self.closed().await;
        Ok(())
    }

    /// Resolves once the actor has exited.
    pub async fn closed(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }
}

#[async_trait]
impl TokenSource for CredentialManager {
    async fn bearer_token(&self) -> SyncResult<String> {
        Ok(self.token().await?.token)
    }

    async fn invalidate(&self) -> SyncResult<()> {
        debug!("invalidating credential");
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Request::Invalidate(ack))
            .await
            .map_err(|_| SyncError::Closed)?;
        rx.await.map_err(|_| SyncError::Closed)?
    }
}

struct Actor {
    url: String,
    consumer_key: String,
    consumer_secret: String,
    plugin_details: String,
    refresh_margin: Duration,
    backoff: BackoffConfig,
    http: Arc<SyncHttpClient>,
    store: Arc<LocalStore>,
    cancel: CancellationToken,
    current: Option<Credential>,
    retrievals: u64,
    credential_tx: watch::Sender<Option<Credential>>,
    state_tx: watch::Sender<CredentialState>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        loop {
            let refresh_at = self.current.as_ref().map(|credential| {
                Instant::now() + credential.refresh_in(self.refresh_margin, Utc::now())
            });

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = wait_until(refresh_at) => {
                    debug!("scheduled credential refresh");
                    if self.refresh().await.is_err() {
                        break;
                    }
                }
                request = rx.recv() => match request {
                    None => break,
                    Some(Request::Get(ack)) => {
                        let valid = self.current.as_ref().is_some_and(|c| c.is_valid());
                        let result = if valid {
                            Ok(())
                        } else {
                            self.refresh().await
                        };
                        let reply = result.and_then(|()| {
                            self.current.clone().ok_or(SyncError::Closed)
                        });
                        let _ = ack.send(reply);
                    }
                    Some(Request::Invalidate(ack)) => {
                        let result = self.refresh().await;
                        let _ = ack.send(result);
                    }
                },
            }
        }
        debug!("credential manager stopped");
    }

    /// Retrieves a new credential, retrying until success or cancellation.
    async fn refresh(&mut self) -> SyncResult<()> {
        let _ = self.state_tx.send(CredentialState::Refreshing);
        let attempt = self.retrievals + 1;
        let result = retry_until_success(
            &self.cancel,
            Backoff::from_config(&self.backoff),
            || self.retrieve(attempt),
            |err| error!(error = %err, "failed to retrieve credential"),
        )
        .await;

        match result {
            Ok(credential) => {
                self.retrievals = attempt;
                info!(
                    expires_at = %credential.expires_at,
                    retrievals = attempt,
                    "retrieved new credential"
                );
                self.current = Some(credential.clone());
                let _ = self.credential_tx.send(Some(credential));
                let _ = self.state_tx.send(CredentialState::Valid);
                Ok(())
            }
            Err(err) => {
                let state = if self.current.is_some() {
                    CredentialState::Valid
                } else {
                    CredentialState::NoCredential
                };
                let _ = self.state_tx.send(state);
                Err(err)
            }
        }
    }

    async fn retrieve(&self, attempt: u64) -> SyncResult<Credential> {
        let identity = self.http.identity().read().clone();
        let mut request = self
            .http
            .inner()
            .post(&self.url)
            .header(headers::DISPLAY_NAME, identity.instance_name.as_str())
            .header(headers::INSTANCE_ID, identity.instance_id.as_str())
            .header(headers::CLUSTER_ID, identity.cluster_id.as_str())
            .header(headers::STATUS, headers::STATUS_ONLINE)
            .header(headers::PLUGIN_DETAILS, self.plugin_details.as_str())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.consumer_key.as_str()),
                ("client_secret", self.consumer_secret.as_str()),
            ]);
        request = if identity.is_new {
            request.header(headers::CREATED_AT, now_rfc3339())
        } else {
            request.header(headers::UPDATED_AT, now_rfc3339())
        };

        let response = request.send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(unexpected_status(response).await);
        }
        let body = response.bytes().await?;
        let token = AccessTokenResponse::decode(&body)?;
        let credential = Credential::from_response(&token, Utc::now(), attempt)?;

        if identity.is_new {
            let mut saved = identity;
            saved.is_new = false;
            self.store.save_identity(&saved).await?;
            self.http.identity().write().is_new = false;
            debug!(instance_id = %saved.instance_id, "registered new instance");
        }
        Ok(credential)
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

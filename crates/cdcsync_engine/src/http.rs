//! HTTP plumbing shared by the credential, snapshot and change clients.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::identity::SharedIdentity;
use cdcsync_protocol::headers;
use chrono::{SecondsFormat, Utc};
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder};
use std::time::Duration;

/// Idle connections kept per host.
const POOL_IDLE_PER_HOST: usize = 10;

/// Longest response body kept in error messages.
const ERROR_BODY_LIMIT: usize = 512;

/// HTTP client carrying the instance headers on every request.
pub struct SyncHttpClient {
    client: Client,
    identity: SharedIdentity,
    last_error: RwLock<Option<String>>,
}

impl SyncHttpClient {
    /// Creates a client with the configured timeout.
    pub fn new(config: &SyncConfig, identity: SharedIdentity) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .pool_max_idle_per_host(POOL_IDLE_PER_HOST)
            .connect_timeout(Duration::from_secs(10).min(config.http_timeout))
            .build()
            .map_err(|e| SyncError::transport_fatal(e.to_string()))?;
        Ok(Self {
            client,
            identity,
            last_error: RwLock::new(None),
        })
    }

    /// The underlying client, for unauthenticated requests.
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// The shared identity.
    pub fn identity(&self) -> &SharedIdentity {
        &self.identity
    }

    /// GET with the bearer token and instance headers.
    pub fn authorized_get(&self, url: &str, token: &str) -> RequestBuilder {
        let identity = self.identity.read();
        self.client
            .get(url)
            .bearer_auth(token)
            .header(headers::INSTANCE_ID, identity.instance_id.as_str())
            .header(headers::CLUSTER_ID, identity.cluster_id.as_str())
            .header(headers::UPDATED_AT, now_rfc3339())
    }

    /// Returns the last recorded error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Records a failed request.
    pub fn set_error(&self, err: &SyncError) {
        *self.last_error.write() = Some(err.to_string());
    }

    /// Clears the recorded error after a successful request.
    pub fn clear_error(&self) {
        *self.last_error.write() = None;
    }
}

/// Joins a base URI and a path with exactly one slash.
pub fn endpoint(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Current time in the header format.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Builds an `UnexpectedStatus` error from a response.
pub async fn unexpected_status(response: reqwest::Response) -> SyncError {
    let status = response.status().as_u16();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    SyncError::UnexpectedStatus { status, body }
}

//! Emulated remote serving the token, snapshot and change endpoints.
//!
//! All three services share one `wiremock` server, so a test points every
//! base URI at [`MockRemote::uri`]. Tokens are issued as `token-1`,
//! `token-2`, ... and only the most recent one is accepted.

use crate::fixtures::sqlite_snapshot_bytes;
use cdcsync_protocol::{headers, ChangeList, Snapshot, SNAPSHOT_TOO_OLD};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Delay before answering a long poll with nothing to deliver.
const IDLE_POLL_DELAY: Duration = Duration::from_millis(50);

/// A recorded snapshot request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    /// Requested scopes, in request order.
    pub scopes: Vec<String>,
    /// `Accept` header.
    pub accept: String,
}

/// A recorded change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRequest {
    /// `since` parameter, if sent.
    pub since: Option<String>,
    /// `block` parameter, if sent.
    pub block: Option<String>,
    /// Requested scopes, in request order.
    pub scopes: Vec<String>,
    /// `snapshot` parameter, if sent.
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct SnapshotBodies {
    id: String,
    json: Vec<u8>,
    sqlite: Vec<u8>,
}

impl SnapshotBodies {
    async fn encode(snapshot: &Snapshot) -> Self {
        Self {
            id: snapshot.snapshot_info.clone(),
            json: snapshot.encode().expect("Failed to encode snapshot"),
            sqlite: sqlite_snapshot_bytes(snapshot).await,
        }
    }
}

#[derive(Default)]
struct RemoteState {
    cluster_id: String,
    token_ttl_ms: AtomicI64,
    tokens_issued: AtomicUsize,
    current_token: Mutex<Option<String>>,
    too_old_pending: AtomicUsize,
    boot: Mutex<SnapshotBodies>,
    data: Mutex<SnapshotBodies>,
    batches: Mutex<VecDeque<ChangeList>>,
    snapshot_requests: Mutex<Vec<SnapshotRequest>>,
    change_requests: Mutex<Vec<ChangeRequest>>,
    unauthorized: AtomicUsize,
}

impl RemoteState {
    fn is_authorized(&self, request: &Request) -> bool {
        let presented = request
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        let current = self.current_token.lock();
        let authorized = matches!((presented, current.as_deref()), (Some(p), Some(c)) if p == c);
        if !authorized {
            self.unauthorized.fetch_add(1, Ordering::SeqCst);
        }
        authorized
    }

    fn issue_token(&self) -> ResponseTemplate {
        let n = self.tokens_issued.fetch_add(1, Ordering::SeqCst) + 1;
        let token = format!("token-{n}");
        *self.current_token.lock() = Some(token.clone());
        ResponseTemplate::new(200).set_body_json(json!({
            "accessToken": token,
            "expiresIn": self.token_ttl_ms.load(Ordering::SeqCst),
        }))
    }

    fn serve_snapshot(&self, request: &Request) -> ResponseTemplate {
        if !self.is_authorized(request) {
            return ResponseTemplate::new(401);
        }
        let scopes = query_values(request, "scope");
        let accept = request
            .headers
            .get("accept")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let is_boot = scopes.len() == 1 && scopes[0] == self.cluster_id;
        self.snapshot_requests.lock().push(SnapshotRequest {
            scopes,
            accept: accept.clone(),
        });

        let bodies = if is_boot {
            self.boot.lock().clone()
        } else {
            self.data.lock().clone()
        };
        if accept.contains("sqlite") {
            ResponseTemplate::new(200)
                .insert_header(headers::SNAPSHOT_TXID, bodies.id.as_str())
                .set_body_raw(bodies.sqlite, headers::MEDIA_SQLITE)
        } else {
            ResponseTemplate::new(200).set_body_raw(bodies.json, headers::MEDIA_JSON)
        }
    }

    fn serve_changes(&self, request: &Request) -> ResponseTemplate {
        if !self.is_authorized(request) {
            return ResponseTemplate::new(401);
        }
        self.change_requests.lock().push(ChangeRequest {
            since: query_values(request, "since").into_iter().next(),
            block: query_values(request, "block").into_iter().next(),
            scopes: query_values(request, "scope"),
            snapshot: query_values(request, "snapshot").into_iter().next(),
        });

        let too_old = self
            .too_old_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if too_old {
            return ResponseTemplate::new(400).set_body_json(json!({
                "code": SNAPSHOT_TOO_OLD,
                "message": "snapshot is too old",
            }));
        }

        match self.batches.lock().pop_front() {
            Some(batch) => ResponseTemplate::new(200).set_body_json(&batch),
            None => ResponseTemplate::new(304).set_delay(IDLE_POLL_DELAY),
        }
    }
}

fn query_values(request: &Request, name: &str) -> Vec<String> {
    request
        .url
        .query_pairs()
        .filter(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .collect()
}

/// An emulated remote for one cluster.
pub struct MockRemote {
    server: MockServer,
    state: Arc<RemoteState>,
}

impl MockRemote {
    /// Starts a remote serving empty snapshots and no changes.
    pub async fn start(cluster_id: &str) -> Self {
        let server = MockServer::start().await;
        let state = Arc::new(RemoteState {
            cluster_id: cluster_id.to_string(),
            token_ttl_ms: AtomicI64::new(3_600_000),
            ..RemoteState::default()
        });

        let tokens = state.clone();
        Mock::given(method("POST"))
            .and(path("/accesstoken"))
            .respond_with(move |_: &Request| tokens.issue_token())
            .mount(&server)
            .await;

        let snapshots = state.clone();
        Mock::given(method("GET"))
            .and(path("/snapshots"))
            .respond_with(move |request: &Request| snapshots.serve_snapshot(request))
            .mount(&server)
            .await;

        let changes = state.clone();
        Mock::given(method("GET"))
            .and(path("/changes"))
            .respond_with(move |request: &Request| changes.serve_changes(request))
            .mount(&server)
            .await;

        Self { server, state }
    }

    /// Base URI for all three services.
    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Serves `snapshot` for requests naming only the cluster scope.
    pub async fn set_boot_snapshot(&self, snapshot: Snapshot) {
        let bodies = SnapshotBodies::encode(&snapshot).await;
        *self.state.boot.lock() = bodies;
    }

    /// Serves `snapshot` for every other snapshot request.
    pub async fn set_data_snapshot(&self, snapshot: Snapshot) {
        let bodies = SnapshotBodies::encode(&snapshot).await;
        *self.state.data.lock() = bodies;
    }

    /// Queues a batch for the next change request.
    pub fn push_changes(&self, batch: ChangeList) {
        self.state.batches.lock().push_back(batch);
    }

    /// Batches not yet delivered.
    pub fn pending_changes(&self) -> usize {
        self.state.batches.lock().len()
    }

    /// Sets the `expiresIn` value of issued tokens, in milliseconds.
    pub fn set_token_ttl_ms(&self, ttl_ms: i64) {
        self.state.token_ttl_ms.store(ttl_ms, Ordering::SeqCst);
    }

    /// Stops accepting the current token until a new one is issued.
    pub fn revoke_tokens(&self) {
        *self.state.current_token.lock() = None;
    }

    /// Answers the next `times` change requests with `SNAPSHOT_TOO_OLD`.
    pub fn snapshot_too_old(&self, times: usize) {
        self.state.too_old_pending.store(times, Ordering::SeqCst);
    }

    /// Tokens issued so far.
    pub fn tokens_issued(&self) -> usize {
        self.state.tokens_issued.load(Ordering::SeqCst)
    }

    /// Requests rejected with 401 so far.
    pub fn unauthorized_requests(&self) -> usize {
        self.state.unauthorized.load(Ordering::SeqCst)
    }

    /// Snapshot requests received so far.
    pub fn snapshot_requests(&self) -> Vec<SnapshotRequest> {
        self.state.snapshot_requests.lock().clone()
    }

    /// Change requests received so far.
    pub fn change_requests(&self) -> Vec<ChangeRequest> {
        self.state.change_requests.lock().clone()
    }
}

/// Polls `check` every 20ms until it returns true or `timeout` elapses.
///
/// Returns the last result of `check`.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

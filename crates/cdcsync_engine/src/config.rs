//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use std::path::PathBuf;
use std::time::Duration;

/// Name used when the host name cannot be determined.
pub const UNDEFINED_INSTANCE_NAME: &str = "Undefined";

/// Encoding requested for snapshot downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotProtocol {
    /// Structured JSON, ingested row by row.
    Json,
    /// Binary SQLite database, written straight to disk.
    #[default]
    Sqlite,
}

impl SnapshotProtocol {
    /// Media type sent in the `Accept` header.
    pub fn media_type(&self) -> &'static str {
        match self {
            SnapshotProtocol::Json => cdcsync_protocol::headers::MEDIA_JSON,
            SnapshotProtocol::Sqlite => cdcsync_protocol::headers::MEDIA_SQLITE,
        }
    }
}

impl std::str::FromStr for SnapshotProtocol {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(SnapshotProtocol::Json),
            "sqlite" => Ok(SnapshotProtocol::Sqlite),
            other => Err(SyncError::InvalidConfig(format!(
                "unknown snapshot protocol {other:?}"
            ))),
        }
    }
}

/// Whether the engine talks to the remote services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Download snapshots and poll for changes.
    #[default]
    Online,
    /// Serve the existing local snapshot only.
    Offline,
}

impl std::str::FromStr for SyncMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("online") {
            Ok(SyncMode::Online)
        } else if s.eq_ignore_ascii_case("offline") {
            Ok(SyncMode::Offline)
        } else {
            Err(SyncError::InvalidConfig(format!("unknown mode {s:?}")))
        }
    }
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URI of the token service.
    pub token_base_uri: String,
    /// Base URI of the snapshot service.
    pub snapshot_base_uri: String,
    /// Base URI of the change service.
    pub change_base_uri: String,
    /// OAuth client id.
    pub consumer_key: String,
    /// OAuth client secret.
    pub consumer_secret: String,
    /// Cluster this instance belongs to.
    pub cluster_id: String,
    /// Display name reported to the token service.
    pub instance_name: String,
    /// Snapshot encoding.
    pub snapshot_protocol: SnapshotProtocol,
    /// Directory holding the default database and snapshot generations.
    pub data_dir: PathBuf,
    /// Retry backoff.
    pub backoff: BackoffConfig,
    /// How long the change server may hold a poll open.
    pub long_poll_block: Duration,
    /// Timeout for every HTTP request. Must exceed `long_poll_block`.
    pub http_timeout: Duration,
    /// How long to wait for subscribers to acknowledge a publish.
    pub publish_timeout: Duration,
    /// How long before expiry a credential is refreshed.
    pub refresh_margin: Duration,
    /// JSON sent in the `plugin_details` header.
    pub plugin_details: String,
    /// Online or offline operation.
    pub mode: SyncMode,
}

impl SyncConfig {
    /// Creates a configuration for the given services and cluster.
    pub fn new(
        token_base_uri: impl Into<String>,
        snapshot_base_uri: impl Into<String>,
        change_base_uri: impl Into<String>,
        cluster_id: impl Into<String>,
    ) -> Self {
        Self {
            token_base_uri: token_base_uri.into(),
            snapshot_base_uri: snapshot_base_uri.into(),
            change_base_uri: change_base_uri.into(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
            cluster_id: cluster_id.into(),
            instance_name: default_instance_name(),
            snapshot_protocol: SnapshotProtocol::default(),
            data_dir: PathBuf::from("."),
            backoff: BackoffConfig::default(),
            long_poll_block: Duration::from_secs(45),
            http_timeout: Duration::from_secs(60),
            publish_timeout: Duration::from_secs(60),
            refresh_margin: Duration::from_secs(60),
            plugin_details: default_plugin_details(),
            mode: SyncMode::default(),
        }
    }

    /// Sets the OAuth client credentials.
    pub fn with_consumer(mut self, key: impl Into<String>, secret: impl Into<String>) -> Self {
        self.consumer_key = key.into();
        self.consumer_secret = secret.into();
        self
    }

    /// Sets the display name.
    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }

    /// Sets the snapshot encoding.
    pub fn with_snapshot_protocol(mut self, protocol: SnapshotProtocol) -> Self {
        self.snapshot_protocol = protocol;
        self
    }

    /// Sets the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Sets the retry backoff.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the long-poll block duration.
    pub fn with_long_poll_block(mut self, block: Duration) -> Self {
        self.long_poll_block = block;
        self
    }

    /// Sets the HTTP request timeout.
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Sets the publish timeout.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Sets the credential refresh margin.
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Sets the plugin details header value.
    pub fn with_plugin_details(mut self, details: impl Into<String>) -> Self {
        self.plugin_details = details.into();
        self
    }

    /// Sets the mode.
    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    /// Checks that the configuration is usable.
    pub fn validate(&self) -> SyncResult<()> {
        let required = [
            ("token base URI", &self.token_base_uri),
            ("snapshot base URI", &self.snapshot_base_uri),
            ("change base URI", &self.change_base_uri),
            ("cluster id", &self.cluster_id),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(SyncError::InvalidConfig(format!("{name} is required")));
            }
        }
        if self.mode == SyncMode::Online
            && (self.consumer_key.is_empty() || self.consumer_secret.is_empty())
        {
            return Err(SyncError::InvalidConfig(
                "consumer key and secret are required".into(),
            ));
        }
        if self.http_timeout <= self.long_poll_block {
            return Err(SyncError::InvalidConfig(format!(
                "http timeout {:?} must exceed long-poll block {:?}",
                self.http_timeout, self.long_poll_block
            )));
        }
        if serde_json::from_str::<serde_json::Value>(&self.plugin_details).is_err() {
            return Err(SyncError::InvalidConfig(
                "plugin details must be valid JSON".into(),
            ));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("", "", "", "")
    }
}

/// Configuration for retry backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// First interval.
    pub initial: Duration,
    /// Upper bound on any interval. This is also the poll interval.
    pub max: Duration,
    /// Growth factor per attempt.
    pub factor: f64,
}

impl BackoffConfig {
    /// Creates a backoff configuration.
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(120),
            factor: 2.0,
        }
    }
}

fn default_plugin_details() -> String {
    serde_json::json!([{ "name": "cdcsync", "schemaVer": "1.0" }]).to_string()
}

/// Host name, else [`UNDEFINED_INSTANCE_NAME`].
pub fn default_instance_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| UNDEFINED_INSTANCE_NAME.to_string())
}

//! Run command implementation.

use cdcsync_engine::{BackoffConfig, SnapshotProtocol, SyncConfig, SyncEngine, SyncMode};
use cdcsync_token_api::{TokenApiConfig, TokenApiServer};
use clap::Args;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Options of the `run` command.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Base URI of the token service
    #[arg(long, env = "CDCSYNC_TOKEN_BASE_URI")]
    pub token_base_uri: String,

    /// Base URI of the snapshot service
    #[arg(long, env = "CDCSYNC_SNAPSHOT_BASE_URI")]
    pub snapshot_base_uri: String,

    /// Base URI of the change service
    #[arg(long, env = "CDCSYNC_CHANGE_BASE_URI")]
    pub change_base_uri: String,

    /// Cluster this instance belongs to
    #[arg(long, env = "CDCSYNC_CLUSTER_ID")]
    pub cluster_id: String,

    /// OAuth client id
    #[arg(long, env = "CDCSYNC_CONSUMER_KEY", default_value = "")]
    pub consumer_key: String,

    /// OAuth client secret
    #[arg(long, env = "CDCSYNC_CONSUMER_SECRET", default_value = "", hide_env_values = true)]
    pub consumer_secret: String,

    /// Name reported to the token service (defaults to the host name)
    #[arg(long, env = "CDCSYNC_INSTANCE_NAME")]
    pub instance_name: Option<String>,

    /// Snapshot encoding (json, sqlite)
    #[arg(long, env = "CDCSYNC_SNAPSHOT_PROTOCOL", default_value = "sqlite")]
    pub snapshot_protocol: String,

    /// Operating mode (online, offline)
    #[arg(long, env = "CDCSYNC_MODE", default_value = "online")]
    pub mode: String,

    /// Longest wait between retries, in seconds
    #[arg(long, env = "CDCSYNC_POLL_INTERVAL", default_value_t = 120)]
    pub poll_interval: u64,

    /// Long-poll block for change requests, in seconds
    #[arg(long, env = "CDCSYNC_LONG_POLL_BLOCK", default_value_t = 45)]
    pub long_poll_block: u64,

    /// HTTP request timeout, in seconds
    #[arg(long, env = "CDCSYNC_HTTP_TIMEOUT", default_value_t = 60)]
    pub http_timeout: u64,

    /// Serve the current token on this address
    #[arg(long, env = "CDCSYNC_TOKEN_API_ADDR")]
    pub token_api_addr: Option<SocketAddr>,
}

impl RunArgs {
    /// Builds the engine configuration.
    pub fn to_config(&self, data_dir: &Path) -> Result<SyncConfig, Box<dyn std::error::Error>> {
        let protocol: SnapshotProtocol = self.snapshot_protocol.parse()?;
        let mode: SyncMode = self.mode.parse()?;
        let backoff = BackoffConfig {
            max: Duration::from_secs(self.poll_interval),
            ..BackoffConfig::default()
        };

        let mut config = SyncConfig::new(
            &self.token_base_uri,
            &self.snapshot_base_uri,
            &self.change_base_uri,
            &self.cluster_id,
        )
        .with_consumer(&self.consumer_key, &self.consumer_secret)
        .with_data_dir(data_dir)
        .with_snapshot_protocol(protocol)
        .with_mode(mode)
        .with_backoff(backoff)
        .with_long_poll_block(Duration::from_secs(self.long_poll_block))
        .with_http_timeout(Duration::from_secs(self.http_timeout));
        if let Some(name) = &self.instance_name {
            config = config.with_instance_name(name);
        }
        config.validate()?;
        Ok(config)
    }
}

/// Runs the engine until interrupted or a fatal error occurs.
pub async fn run(data_dir: &Path, args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.to_config(data_dir)?;
    info!(
        cluster = %config.cluster_id,
        data_dir = %data_dir.display(),
        mode = ?config.mode,
        "starting sync engine"
    );
    let engine = Arc::new(SyncEngine::new(config).await?);

    let cancel = CancellationToken::new();
    let api = args.token_api_addr.map(|addr| {
        let server = TokenApiServer::new(TokenApiConfig::new(addr), engine.credentials());
        let cancel = cancel.clone();
        tokio::spawn(async move { server.serve(cancel).await })
    });

    let mut runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };

    let result = tokio::select! {
        joined = &mut runner => joined,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            engine.close().await?;
            runner.await
        }
    };

    cancel.cancel();
    if let Some(api) = api {
        match api.await {
            Ok(Err(err)) => warn!(error = %err, "token endpoint failed"),
            Err(err) => warn!(error = %err, "token endpoint task failed"),
            Ok(Ok(())) => {}
        }
    }

    match result? {
        Ok(()) => {
            if let Err(err) = engine.close().await {
                if !err.is_shutdown() {
                    warn!(error = %err, "error while closing");
                }
            }
            info!("sync engine stopped");
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "sync engine stopped on fatal error");
            let _ = engine.close().await;
            Err(err.into())
        }
    }
}

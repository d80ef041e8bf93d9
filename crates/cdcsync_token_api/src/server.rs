//! Token endpoint server.

use crate::config::TokenApiConfig;
use crate::error::ApiResult;
use crate::handler::{get_access_token, HandlerContext, TokenFeed};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Path of the token endpoint.
pub const TOKEN_PATH: &str = "/accesstoken";

/// Serves the current bearer token to local clients.
///
/// # Example
///
/// ```rust,ignore
/// use cdcsync_token_api::{TokenApiConfig, TokenApiServer};
///
/// let server = TokenApiServer::new(TokenApiConfig::default(), engine.credentials());
/// server.serve(cancel.clone()).await?;
/// ```
pub struct TokenApiServer {
    config: TokenApiConfig,
    feed: Arc<dyn TokenFeed>,
}

impl TokenApiServer {
    /// Creates a server for `feed`.
    pub fn new(config: TokenApiConfig, feed: Arc<dyn TokenFeed>) -> Self {
        Self { config, feed }
    }

    /// Configuration in use.
    pub fn config(&self) -> &TokenApiConfig {
        &self.config
    }

    /// Builds the router.
    pub fn router(&self) -> Router {
        let ctx = HandlerContext {
            feed: self.feed.clone(),
            max_block: self.config.max_block,
        };
        Router::new()
            .route(TOKEN_PATH, get(get_access_token))
            .with_state(ctx)
    }

    /// Binds the configured address and serves until `cancel` fires.
    pub async fn serve(&self, cancel: CancellationToken) -> ApiResult<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve_on(listener, cancel).await
    }

    /// Serves on an already bound listener until `cancel` fires.
    pub async fn serve_on(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> ApiResult<()> {
        let addr: SocketAddr = listener.local_addr()?;
        info!(%addr, "token endpoint listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;
        info!("token endpoint stopped");
        Ok(())
    }
}

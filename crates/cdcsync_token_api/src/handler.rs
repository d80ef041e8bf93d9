//! `GET /accesstoken` handler.

use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::header::IF_NONE_MATCH;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use cdcsync_engine::{CredentialManager, TokenSource};
use cdcsync_protocol::Credential;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Source of the bearer token served by the endpoint.
#[async_trait]
pub trait TokenFeed: Send + Sync {
    /// Current valid token, retrieving one first if needed.
    async fn current_token(&self) -> ApiResult<String>;

    /// Watches credential changes.
    fn watch(&self) -> watch::Receiver<Option<Credential>>;
}

#[async_trait]
impl TokenFeed for CredentialManager {
    async fn current_token(&self) -> ApiResult<String> {
        Ok(self.bearer_token().await?)
    }

    fn watch(&self) -> watch::Receiver<Option<Credential>> {
        self.subscribe()
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct HandlerContext {
    /// Token source.
    pub feed: Arc<dyn TokenFeed>,
    /// Upper bound on `block`.
    pub max_block: Duration,
}

/// Query parameters of `GET /accesstoken`.
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    /// Seconds to wait for a token different from `If-None-Match`.
    pub block: Option<String>,
}

/// Parses `block` as a non-negative number of seconds.
pub fn parse_block(block: Option<&str>, max_block: Duration) -> ApiResult<Duration> {
    match block {
        None | Some("") => Ok(Duration::ZERO),
        Some(value) => value
            .parse::<u64>()
            .map(|secs| Duration::from_secs(secs).min(max_block))
            .map_err(|_| {
                ApiError::InvalidRequest("bad block value, must be number of seconds".into())
            }),
    }
}

/// Returns the current token, or waits up to `block` seconds for a new one.
///
/// A token different from `If-None-Match` is returned at once. Otherwise
/// the request waits for the credential to change, answering 304 if it
/// does not within the block interval.
pub async fn get_access_token(
    State(ctx): State<HandlerContext>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let block = parse_block(query.block.as_deref(), ctx.max_block)?;
    let if_none_match = headers
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut updates = ctx.feed.watch();
    let current = ctx.feed.current_token().await?;
    if current != if_none_match {
        return Ok(current.into_response());
    }

    debug!(?block, "waiting for a new token");
    let changed = tokio::time::timeout(
        block,
        updates.wait_for(|credential| {
            credential
                .as_ref()
                .is_some_and(|credential| credential.token != current)
        }),
    )
    .await;

    match changed {
        Ok(Ok(credential)) => match &*credential {
            Some(credential) => Ok(credential.token.clone().into_response()),
            None => Ok(StatusCode::NOT_MODIFIED.into_response()),
        },
        Ok(Err(_)) => Err(ApiError::Unavailable("credential manager closed".into())),
        Err(_) => Ok(StatusCode::NOT_MODIFIED.into_response()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_parsing() {
        let max = Duration::from_secs(60);
        assert_eq!(parse_block(None, max).unwrap(), Duration::ZERO);
        assert_eq!(parse_block(Some(""), max).unwrap(), Duration::ZERO);
        assert_eq!(parse_block(Some("5"), max).unwrap(), Duration::from_secs(5));
        assert_eq!(parse_block(Some("600"), max).unwrap(), max);
        assert!(parse_block(Some("-1"), max).unwrap_err().is_client_error());
        assert!(parse_block(Some("soon"), max).is_err());
    }
}

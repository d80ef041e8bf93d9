//! # cdcsync token API
//!
//! Local HTTP endpoint exposing the sync engine's bearer token.
//!
//! This crate provides:
//! - `GET /accesstoken`, returning the current token as plain text
//! - Long-polling via `block=<secs>` and `If-None-Match`
//! - `{errorCode, reason}` JSON errors for malformed requests
//!
//! # Protocol
//!
//! A client that already holds a token sends it in `If-None-Match` along
//! with `block`. The request returns as soon as the token changes, or with
//! 304 once `block` seconds have passed.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod server;

pub use config::TokenApiConfig;
pub use error::{ApiError, ApiResult, ErrorBody};
pub use handler::{get_access_token, parse_block, HandlerContext, TokenFeed, TokenQuery};
pub use server::{TokenApiServer, TOKEN_PATH};

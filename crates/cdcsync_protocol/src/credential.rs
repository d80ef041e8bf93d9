//! Access credential wire format and validity rules.

use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Validity assumed when the server reports no usable expiry.
pub const DEFAULT_VALIDITY: std::time::Duration =
    std::time::Duration::from_secs(365 * 24 * 60 * 60);

/// Body of a successful token request.
///
/// `expires_in` is in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessTokenResponse {
    /// Bearer token.
    pub access_token: String,
    /// Validity in milliseconds from issue.
    pub expires_in: i64,
    /// Issue time in milliseconds since the epoch, as reported by the server.
    pub issued_at: i64,
    /// Application the token was issued to.
    pub application_name: String,
    /// Granted scope.
    pub scope: String,
    /// Token status.
    pub status: String,
    /// Token type, normally `BearerToken`.
    pub token_type: String,
    /// Client id the token belongs to.
    pub client_id: String,
    /// Refresh token validity in milliseconds.
    pub refresh_token_expires_in: i64,
    /// Server-side refresh count.
    pub refresh_count: i64,
    /// API products granted.
    pub api_product_list: Vec<String>,
}

impl AccessTokenResponse {
    /// Decodes a response body.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// The bearer credential currently in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Bearer token.
    pub token: String,
    /// Local time the credential was retrieved.
    pub issued_at: DateTime<Utc>,
    /// Local time after which the credential is invalid.
    pub expires_at: DateTime<Utc>,
    /// Number of retrievals this process has performed, including this one.
    pub refresh_count: u64,
}

impl Credential {
    /// Builds a credential from a token response received at `now`.
    ///
    /// A non-positive `expires_in` is treated as [`DEFAULT_VALIDITY`].
    pub fn from_response(
        response: &AccessTokenResponse,
        now: DateTime<Utc>,
        refresh_count: u64,
    ) -> ProtocolResult<Self> {
        if response.access_token.is_empty() {
            return Err(ProtocolError::EmptyToken);
        }
        let validity = if response.expires_in > 0 {
            Duration::milliseconds(response.expires_in)
        } else {
            Duration::from_std(DEFAULT_VALIDITY).unwrap_or(Duration::days(365))
        };
        let expires_at = now.checked_add_signed(validity).unwrap_or(DateTime::<Utc>::MAX_UTC);
        Ok(Self {
            token: response.access_token.clone(),
            issued_at: now,
            expires_at,
            refresh_count,
        })
    }

    /// Returns true if the credential is unexpired now.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Returns true if the credential is unexpired at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.token.is_empty() && now < self.expires_at
    }

    /// Time from `now` until the credential should be refreshed.
    ///
    /// Zero if the refresh point has already passed.
    pub fn refresh_in(
        &self,
        margin: std::time::Duration,
        now: DateTime<Utc>,
    ) -> std::time::Duration {
        let margin = Duration::from_std(margin).unwrap_or(Duration::zero());
        let deadline = self.expires_at - margin;
        (deadline - now).to_std().unwrap_or(std::time::Duration::ZERO)
    }

    /// Returns true if the credential is within `margin` of expiry at `now`.
    pub fn needs_refresh(&self, margin: std::time::Duration, now: DateTime<Utc>) -> bool {
        self.refresh_in(margin, now).is_zero()
    }
}

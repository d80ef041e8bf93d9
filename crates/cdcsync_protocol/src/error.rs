//! Error types for the wire protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error code the change server sends when the requested snapshot is too old.
pub const SNAPSHOT_TOO_OLD: &str = "SNAPSHOT_TOO_OLD";

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding wire messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Body was not valid JSON for the expected message.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unknown change operation code.
    #[error("unknown change operation code {0}")]
    UnknownOperation(u8),

    /// Credential response carried no token.
    #[error("credential response has no access token")]
    EmptyToken,
}

/// Error body returned by the change server with a 400 status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeServerError {
    /// Machine-readable error code.
    pub code: String,
}

impl ChangeServerError {
    /// Creates an error body with the given code.
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }

    /// Decodes an error body.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Returns true if the server reports the snapshot as too old.
    pub fn is_snapshot_too_old(&self) -> bool {
        self.code == SNAPSHOT_TOO_OLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_snapshot_too_old() {
        let err = ChangeServerError::decode(br#"{"code":"SNAPSHOT_TOO_OLD"}"#).unwrap();
        assert!(err.is_snapshot_too_old());
        assert!(!ChangeServerError::new("OTHER").is_snapshot_too_old());
    }

    #[test]
    fn rejects_garbage() {
        assert!(ChangeServerError::decode(b"not json").is_err());
    }
}

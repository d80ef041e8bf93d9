//! Error types for the sync engine.

use cdcsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Errors fall into four groups: transient ones are retried with backoff,
/// `AuthenticationFailed` invalidates the credential before retrying,
/// `SchemaDrift` triggers a fresh data snapshot, and fatal ones stop the
/// engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Request timed out.
    #[error("operation timed out")]
    Timeout,

    /// Remote answered with a status the caller does not handle.
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// Remote rejected the bearer token.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Local schema no longer matches the change feed.
    #[error("schema drift: {0}")]
    SchemaDrift(String),

    /// Response body could not be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Local database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A delete matched no rows.
    #[error("row not found in table {table}")]
    RowNotFound {
        /// Local table name.
        table: String,
    },

    /// Table has no primary key to address rows by.
    #[error("table {table} has no primary key")]
    MissingPrimaryKey {
        /// Local table name.
        table: String,
    },

    /// Change record lacks the row its operation needs.
    #[error("{operation} on {table} carries no row")]
    MissingRow {
        /// Local table name.
        table: String,
        /// Operation name.
        operation: String,
    },

    /// Change targets a table that must not be modified that way.
    #[error("illegal {operation} on table {table}")]
    IllegalTableOperation {
        /// Wire table name.
        table: String,
        /// Operation name.
        operation: String,
    },

    /// Subscribers did not acknowledge a publish in time.
    #[error("subscribers did not acknowledge within the publish timeout")]
    SubscriberTimeout,

    /// Applied changes could not be checkpointed.
    #[error("failed to persist sequence: {0}")]
    SequencePersistence(String),

    /// Unrecoverable condition.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Operation was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Component has already been closed.
    #[error("component closed")]
    Closed,

    /// Configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an illegal-operation error.
    pub fn illegal(table: impl Into<String>, operation: impl std::fmt::Display) -> Self {
        Self::IllegalTableOperation {
            table: table.into(),
            operation: operation.to_string(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout
            | SyncError::UnexpectedStatus { .. }
            | SyncError::AuthenticationFailed(_)
            | SyncError::SchemaDrift(_)
            | SyncError::MalformedResponse(_)
            | SyncError::Database(_)
            | SyncError::Io(_)
            | SyncError::RowNotFound { .. }
            | SyncError::MissingPrimaryKey { .. }
            | SyncError::MissingRow { .. } => true,
            _ => false,
        }
    }

    /// Returns true if this error must stop the engine.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Transport {
                retryable: false,
                ..
            } | SyncError::IllegalTableOperation { .. }
                | SyncError::SubscriberTimeout
                | SyncError::SequencePersistence(_)
                | SyncError::Fatal(_)
                | SyncError::InvalidConfig(_)
        )
    }

    /// Returns true if the local schema must be refreshed.
    pub fn is_schema_drift(&self) -> bool {
        matches!(self, SyncError::SchemaDrift(_))
    }

    /// Returns true if the error ends a loop without being reported.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, SyncError::Cancelled | SyncError::Closed)
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout
        } else if err.is_decode() {
            SyncError::MalformedResponse(err.to_string())
        } else {
            SyncError::transport_retryable(err.to_string())
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::MalformedResponse(err.to_string())
    }
}

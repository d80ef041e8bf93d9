//! # cdcsync engine
//!
//! Keeps a local SQLite replica in step with a remote change-data-capture
//! service.
//!
//! This crate provides:
//! - Credential management against the token service
//! - Snapshot download (structured JSON or binary SQLite) into database
//!   generations
//! - Long-polling of the change feed with schema drift detection
//! - Transactional application of change batches
//! - Retry with exponential backoff and cancellation
//!
//! ## Architecture
//!
//! On first start the engine downloads a boot snapshot holding the
//! cluster's data scopes, then a data snapshot for those scopes, and then
//! follows the change feed:
//! 1. The change poller long-polls for the next batch
//! 2. The batch is validated against the known tables
//! 3. The event bus delivers it to the applier and waits for the result
//! 4. The cursor is persisted only after the batch has been applied
//!
//! A restart resumes from the last applied snapshot generation.
//!
//! ## Key Invariants
//!
//! - A batch is applied entirely or not at all
//! - The cursor never advances past an unapplied batch
//! - A batch touching an unknown table triggers a new snapshot
//! - At most one credential retrieval and one snapshot download in flight

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod backoff;
mod changes;
mod config;
mod credential;
mod error;
mod events;
mod http;
mod identity;
mod retry;
mod schema;
mod scope_cache;
mod snapshot;
mod state;
mod store;

pub use applier::{build_delete_sql, build_insert_sql, build_update_sql, ChangeApplier};
pub use backoff::Backoff;
pub use changes::ChangePoller;
pub use config::{
    default_instance_name, BackoffConfig, SnapshotProtocol, SyncConfig, SyncMode,
    UNDEFINED_INSTANCE_NAME,
};
pub use credential::{CredentialManager, CredentialState, TokenSource};
pub use error::{SyncError, SyncResult};
pub use events::{Delivery, EventBus, SyncEvent};
pub use http::SyncHttpClient;
pub use identity::{InstanceIdentity, SharedIdentity};
pub use retry::retry_until_success;
pub use schema::{quote_ident, table_info, SqlValue, TableInfo, METADATA_TABLE};
pub use scope_cache::{DataScope, ScopeCache};
pub use snapshot::{DownloadedSnapshot, SnapshotManager};
pub use state::{SyncEngine, SyncState, SyncStats};
pub use store::{
    Generation, LocalStore, BOOTSTRAP_GENERATION, DEFAULT_DB_FILE, GENERATION_DB_FILE,
    SEQUENCE_COLUMN,
};

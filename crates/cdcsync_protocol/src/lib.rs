//! # cdcsync Protocol
//!
//! Wire types shared by the cdcsync engine, its local credential endpoint
//! and the test harness that emulates the remote services.
//!
//! This crate provides:
//! - `Credential` and the access-token response body
//! - `Snapshot` / `Table` for full-state exports
//! - `ChangeList` / `Change` for the incremental change feed
//! - `Row` / `ColumnValue` for row payloads
//! - Table-name normalization and the `KnownTables` set
//! - Header names and error codes used on the wire
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod column;
mod credential;
mod error;
pub mod headers;
mod snapshot;
mod table;

pub use change::{Change, ChangeList, Operation};
pub use column::{text_row, ColumnValue, Row, TEXT_TYPE_ID};
pub use credential::{AccessTokenResponse, Credential, DEFAULT_VALIDITY};
pub use error::{ChangeServerError, ProtocolError, ProtocolResult, SNAPSHOT_TOO_OLD};
pub use snapshot::{Snapshot, Table};
pub use table::{normalize_table_name, KnownTables, CLUSTER_TABLE, DATA_SCOPE_TABLE};

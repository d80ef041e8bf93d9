//! # cdcsync testkit
//!
//! Test utilities for cdcsync.
//!
//! This crate provides:
//! - An emulated remote serving the token, snapshot and change endpoints
//! - Snapshot and change fixtures for a small cluster
//! - Binary (SQLite) encodings of fixture snapshots
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cdcsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn test_against_remote() {
//!     let remote = MockRemote::start(CLUSTER_ID).await;
//!     remote.set_boot_snapshot(boot_snapshot(CLUSTER_ID, &[("s1", "scope-a")])).await;
//!     // ... point the engine at remote.uri()
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod remote;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::remote::*;
}

pub use fixtures::*;
pub use remote::*;

//! Instance identity shared across components.

use parking_lot::RwLock;
use std::sync::Arc;
use uuid::Uuid;

/// Who this replica is, and which snapshot it last applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    /// Random id generated on first run.
    pub instance_id: String,
    /// Display name reported to the token service.
    pub instance_name: String,
    /// Cluster the instance belongs to.
    pub cluster_id: String,
    /// Id of the last applied snapshot, empty if none.
    pub last_snapshot: String,
    /// True until the first credential retrieval succeeds.
    pub is_new: bool,
}

impl InstanceIdentity {
    /// Creates a fresh identity with a random instance id.
    pub fn generate(instance_name: impl Into<String>, cluster_id: impl Into<String>) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            instance_name: instance_name.into(),
            cluster_id: cluster_id.into(),
            last_snapshot: String::new(),
            is_new: true,
        }
    }

    /// Returns true if a snapshot has been applied.
    pub fn has_snapshot(&self) -> bool {
        !self.last_snapshot.is_empty()
    }

    /// Wraps the identity for sharing.
    pub fn shared(self) -> SharedIdentity {
        Arc::new(RwLock::new(self))
    }
}

/// Identity handle injected into every component that needs it.
pub type SharedIdentity = Arc<RwLock<InstanceIdentity>>;

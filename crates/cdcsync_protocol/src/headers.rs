//! Header names and media types used on the wire.

/// Instance identifier header.
pub const INSTANCE_ID: &str = "apid_instance_id";
/// Cluster identifier header.
pub const CLUSTER_ID: &str = "apid_cluster_Id";
/// Display name header (credential requests only).
pub const DISPLAY_NAME: &str = "display_name";
/// Instance status header (credential requests only).
pub const STATUS: &str = "status";
/// Plugin details header (credential requests only).
pub const PLUGIN_DETAILS: &str = "plugin_details";
/// Creation timestamp header, sent on the first credential request.
pub const CREATED_AT: &str = "created_at_apid";
/// Update timestamp header.
pub const UPDATED_AT: &str = "updated_at_apid";
/// Transaction id naming a binary snapshot.
pub const SNAPSHOT_TXID: &str = "Transicator-Snapshot-TXID";

/// Value of the status header.
pub const STATUS_ONLINE: &str = "ONLINE";

/// Media type of a structured (JSON) snapshot.
pub const MEDIA_JSON: &str = "application/json";
/// Media type of a binary SQLite snapshot.
pub const MEDIA_SQLITE: &str = "application/transicator+sqlite";

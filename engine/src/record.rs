//! Feature rows held by a local store.

use crate::{LocalRowId, RemoteRowId, Timestamp};
use serde::{Deserialize, Serialize};

/// One feature in a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRow {
    /// Identifier assigned by the local store
    pub local_id: LocalRowId,
    /// Identifier assigned by the remote system after a successful create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteRowId>,
    /// Feature properties, geometry included, as JSON
    pub properties: serde_json::Value,
    /// When the row was last written (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// Soft delete flag (tombstone)
    pub deleted: bool,
}

impl FeatureRow {
    /// Create a new, never-synced row.
    pub fn new(local_id: LocalRowId, properties: serde_json::Value, timestamp: Timestamp) -> Self {
        Self {
            local_id,
            remote_id: None,
            properties,
            updated_at: timestamp,
            deleted: false,
        }
    }

    /// Check if the row is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Whether the remote system knows this row.
    pub fn is_synced(&self) -> bool {
        self.remote_id.is_some()
    }

    /// Replace the properties.
    pub fn update_properties(&mut self, properties: serde_json::Value, timestamp: Timestamp) {
        self.properties = properties;
        self.updated_at = timestamp;
    }

    /// Mark the row as deleted (soft delete).
    pub fn mark_deleted(&mut self, timestamp: Timestamp) {
        self.deleted = true;
        self.updated_at = timestamp;
    }
}

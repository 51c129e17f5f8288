//! Sync items: the mutations waiting in an audit queue.
//!
//! Local edits are never pushed directly. Each one is recorded as a
//! [`SyncItem`] that names the feature it touched and the kind of change, and
//! stays queued until the remote system acknowledges it.

use crate::{LayerId, LocalRowId, RemoteRowId, StoreId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of change a sync item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Composite key identifying a feature across stores.
///
/// Ordering is store, then layer, then local row, so keys sort the same way
/// regardless of the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureKey {
    pub store_id: StoreId,
    pub layer_id: LayerId,
    pub local_row_id: LocalRowId,
}

impl FeatureKey {
    pub fn new(
        store_id: impl Into<StoreId>,
        layer_id: impl Into<LayerId>,
        local_row_id: LocalRowId,
    ) -> Self {
        Self {
            store_id: store_id.into(),
            layer_id: layer_id.into(),
            local_row_id,
        }
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.store_id, self.layer_id, self.local_row_id)
    }
}

/// A feature key plus the identifier the remote system assigned, if any.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRef {
    #[serde(flatten)]
    pub key: FeatureKey,
    /// Known only after the remote system acknowledged a create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_row_id: Option<RemoteRowId>,
}

impl FeatureRef {
    pub fn new(key: FeatureKey) -> Self {
        Self {
            key,
            remote_row_id: None,
        }
    }

    pub fn with_remote(key: FeatureKey, remote_row_id: impl Into<RemoteRowId>) -> Self {
        Self {
            key,
            remote_row_id: Some(remote_row_id.into()),
        }
    }
}

/// One queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItem {
    /// What happened to the feature
    pub operation: SyncOperation,
    /// The feature it happened to
    pub feature: FeatureRef,
    /// Feature properties at the time of the mutation (null for deletes)
    #[serde(default)]
    pub properties: serde_json::Value,
    /// Queue revision; changes whenever the entry for this key is replaced
    pub seq: u64,
    /// When the mutation was recorded (milliseconds since epoch)
    pub enqueued_at: Timestamp,
}

impl SyncItem {
    /// Create an item. The queue assigns `seq` on enqueue.
    pub fn new(
        operation: SyncOperation,
        feature: FeatureRef,
        properties: serde_json::Value,
        enqueued_at: Timestamp,
    ) -> Self {
        Self {
            operation,
            feature,
            properties,
            seq: 0,
            enqueued_at,
        }
    }

    pub fn create(feature: FeatureRef, properties: serde_json::Value, at: Timestamp) -> Self {
        Self::new(SyncOperation::Create, feature, properties, at)
    }

    pub fn update(feature: FeatureRef, properties: serde_json::Value, at: Timestamp) -> Self {
        Self::new(SyncOperation::Update, feature, properties, at)
    }

    pub fn delete(feature: FeatureRef, at: Timestamp) -> Self {
        Self::new(SyncOperation::Delete, feature, serde_json::Value::Null, at)
    }

    /// The composite key this item is deduplicated by.
    pub fn key(&self) -> &FeatureKey {
        &self.feature.key
    }

    pub fn remote_row_id(&self) -> Option<&str> {
        self.feature.remote_row_id.as_deref()
    }
}

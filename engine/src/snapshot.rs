//! Snapshot types for persisting and restoring store state.
//!
//! Snapshots are the bridge between the in-memory [`FeatureStore`] and
//! whatever persistence the host platform offers. They carry the pending
//! audit queue, so mutations made offline survive a process restart.
//!
//! [`FeatureStore`]: crate::FeatureStore

use crate::{error::Result, AuditEntry, Error, FeatureRow, LayerId, LocalRowId, StoreId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 2;

/// A point-in-time snapshot of a store.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Store the snapshot was taken from
    pub store_id: StoreId,
    /// Whether the store records mutations for upload
    pub syncable: bool,
    /// Next local row id to hand out
    pub next_row_id: LocalRowId,
    /// All rows organized by layer, then by local row id
    pub layers: BTreeMap<LayerId, BTreeMap<LocalRowId, FeatureRow>>,
    /// Pending queue entries in drain order
    pub pending: Vec<AuditEntry>,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(store_id: impl Into<StoreId>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            store_id: store_id.into(),
            syncable: true,
            next_row_id: 1,
            layers: BTreeMap::new(),
            pending: Vec::new(),
        }
    }

    /// Count total rows across all layers.
    pub fn row_count(&self) -> usize {
        self.layers.values().map(|l| l.len()).sum()
    }

    /// Validate internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }

        for (layer, rows) in &self.layers {
            for (id, row) in rows {
                if row.local_id != *id {
                    return Err(Error::InvalidSnapshot(format!(
                        "row keyed {layer}/{id} carries id {}",
                        row.local_id
                    )));
                }
                if row.local_id >= self.next_row_id {
                    return Err(Error::InvalidSnapshot(format!(
                        "row {layer}/{id} is not below next row id {}",
                        self.next_row_id
                    )));
                }
            }
        }

        let mut keys = HashSet::new();
        for item in self.pending.iter().map(|entry| &entry.item) {
            if item.key().store_id != self.store_id {
                return Err(Error::StoreMismatch {
                    expected: self.store_id.clone(),
                    actual: item.key().store_id.clone(),
                });
            }
            if !keys.insert(item.key()) {
                return Err(Error::InvalidSnapshot(format!(
                    "duplicate pending entry for {}",
                    item.key()
                )));
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }
}

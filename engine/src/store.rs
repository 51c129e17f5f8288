//! Feature store - the in-memory state of one local spatial store.
//!
//! The store holds layers of feature rows and the audit queue of mutations
//! not yet acknowledged by the remote system. Every local insert, update and
//! delete is applied to the rows immediately and recorded in the queue.

use crate::{
    error::Result, AuditEntry, AuditQueue, Enqueued, Error, FeatureKey, FeatureRef, FeatureRow, LayerId,
    LocalRowId, RemoteRowId, StoreId, SyncItem, SyncOperation, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A layer of feature rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    rows: HashMap<LocalRowId, FeatureRow>,
}

impl Layer {
    /// Create an empty layer.
    pub fn new() -> Self {
        Self {
            rows: HashMap::new(),
        }
    }

    /// Get a row by local ID.
    pub fn get(&self, id: LocalRowId) -> Option<&FeatureRow> {
        self.rows.get(&id)
    }

    /// Get a mutable row by local ID.
    pub fn get_mut(&mut self, id: LocalRowId) -> Option<&mut FeatureRow> {
        self.rows.get_mut(&id)
    }

    /// Insert a row.
    pub fn insert(&mut self, row: FeatureRow) {
        self.rows.insert(row.local_id, row);
    }

    /// Remove a row entirely.
    pub fn remove(&mut self, id: LocalRowId) -> Option<FeatureRow> {
        self.rows.remove(&id)
    }

    /// Get all active (non-deleted) rows.
    pub fn active_rows(&self) -> impl Iterator<Item = &FeatureRow> {
        self.rows.values().filter(|r| r.is_active())
    }

    /// Get all rows including deleted.
    pub fn all_rows(&self) -> impl Iterator<Item = &FeatureRow> {
        self.rows.values()
    }

    /// Count of active rows.
    pub fn len(&self) -> usize {
        self.rows.values().filter(|r| r.is_active()).count()
    }

    /// Check if the layer has no active rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One local store: layers, rows and the pending mutations.
#[derive(Debug, Clone)]
pub struct FeatureStore {
    store_id: StoreId,
    /// Whether local mutations are recorded for upload
    syncable: bool,
    layers: HashMap<LayerId, Layer>,
    next_row_id: LocalRowId,
    queue: AuditQueue,
}

impl FeatureStore {
    /// Create an empty, syncable store.
    pub fn new(store_id: impl Into<StoreId>) -> Self {
        Self {
            store_id: store_id.into(),
            syncable: true,
            layers: HashMap::new(),
            next_row_id: 1,
            queue: AuditQueue::new(),
        }
    }

    /// Create a store whose mutations are never queued for upload.
    pub fn local_only(store_id: impl Into<StoreId>) -> Self {
        Self {
            syncable: false,
            ..Self::new(store_id)
        }
    }

    pub fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    pub fn is_syncable(&self) -> bool {
        self.syncable
    }

    /// Add a layer if it does not exist yet.
    pub fn add_layer(&mut self, layer: impl Into<LayerId>) -> &mut Layer {
        self.layers.entry(layer.into()).or_default()
    }

    /// Get a layer by name.
    pub fn layer(&self, layer: &str) -> Option<&Layer> {
        self.layers.get(layer)
    }

    /// Layer names, sorted.
    pub fn layer_names(&self) -> Vec<&LayerId> {
        let mut names: Vec<_> = self.layers.keys().collect();
        names.sort();
        names
    }

    fn layer_mut(&mut self, layer: &str) -> Result<&mut Layer> {
        self.layers
            .get_mut(layer)
            .ok_or_else(|| Error::LayerNotFound(layer.to_string()))
    }

    fn key(&self, layer: &str, id: LocalRowId) -> FeatureKey {
        FeatureKey::new(self.store_id.clone(), layer, id)
    }

    fn record(&mut self, item: SyncItem) -> Option<Enqueued> {
        self.syncable.then(|| self.queue.enqueue(item))
    }

    /// Insert a new feature and queue its creation.
    pub fn insert(
        &mut self,
        layer: &str,
        properties: serde_json::Value,
        timestamp: Timestamp,
    ) -> Result<FeatureRef> {
        let id = self.next_row_id;
        self.layer_mut(layer)?
            .insert(FeatureRow::new(id, properties.clone(), timestamp));
        self.next_row_id += 1;

        let feature = FeatureRef::new(self.key(layer, id));
        self.record(SyncItem::create(feature.clone(), properties, timestamp));
        Ok(feature)
    }

    /// Replace a feature's properties and queue the update.
    pub fn update(
        &mut self,
        layer: &str,
        id: LocalRowId,
        properties: serde_json::Value,
        timestamp: Timestamp,
    ) -> Result<FeatureRef> {
        let row = self.live_row(layer, id)?;
        row.update_properties(properties.clone(), timestamp);
        let remote_id = row.remote_id.clone();

        let feature = FeatureRef {
            key: self.key(layer, id),
            remote_row_id: remote_id,
        };
        self.record(SyncItem::update(feature.clone(), properties, timestamp));
        Ok(feature)
    }

    /// Soft-delete a feature and queue the deletion.
    pub fn delete(&mut self, layer: &str, id: LocalRowId, timestamp: Timestamp) -> Result<FeatureRef> {
        let row = self.live_row(layer, id)?;
        row.mark_deleted(timestamp);
        let remote_id = row.remote_id.clone();

        let feature = FeatureRef {
            key: self.key(layer, id),
            remote_row_id: remote_id,
        };
        if self.record(SyncItem::delete(feature.clone(), timestamp)) == Some(Enqueued::Cancelled) {
            // The remote never saw this feature; drop the tombstone too.
            self.layer_mut(layer)?.remove(id);
        }
        Ok(feature)
    }

    fn live_row(&mut self, layer: &str, id: LocalRowId) -> Result<&mut FeatureRow> {
        let row = self
            .layer_mut(layer)?
            .get_mut(id)
            .ok_or_else(|| Error::RowNotFound {
                layer: layer.to_string(),
                row: id,
            })?;
        if row.deleted {
            return Err(Error::RowDeleted {
                layer: layer.to_string(),
                row: id,
            });
        }
        Ok(row)
    }

    /// Store a feature downloaded from the remote system. Not queued.
    pub fn load_remote(
        &mut self,
        layer: &str,
        remote_id: impl Into<RemoteRowId>,
        properties: serde_json::Value,
        timestamp: Timestamp,
    ) -> Result<FeatureRef> {
        let id = self.next_row_id;
        let remote_id = remote_id.into();
        let mut row = FeatureRow::new(id, properties, timestamp);
        row.remote_id = Some(remote_id.clone());
        self.layer_mut(layer)?.insert(row);
        self.next_row_id += 1;
        Ok(FeatureRef::with_remote(self.key(layer, id), remote_id))
    }

    /// Get an active row.
    pub fn get(&self, layer: &str, id: LocalRowId) -> Option<&FeatureRow> {
        self.layers
            .get(layer)
            .and_then(|l| l.get(id))
            .filter(|r| r.is_active())
    }

    /// Get a row including deleted ones.
    pub fn get_including_deleted(&self, layer: &str, id: LocalRowId) -> Option<&FeatureRow> {
        self.layers.get(layer).and_then(|l| l.get(id))
    }

    /// Query rows in a layer.
    pub fn query(&self, layer: &str) -> Option<QueryBuilder<'_>> {
        self.layers.get(layer).map(QueryBuilder::new)
    }

    /// Pending mutations in drain order.
    pub fn pending(&self) -> impl Iterator<Item = &SyncItem> {
        self.queue.iter()
    }

    /// Pending mutations not currently in flight, in drain order.
    pub fn ready(&self) -> impl Iterator<Item = &SyncItem> {
        self.queue.ready()
    }

    /// Get count of pending mutations.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// The audit queue.
    pub fn queue(&self) -> &AuditQueue {
        &self.queue
    }

    fn check_owner(&self, item: &SyncItem) -> Result<()> {
        if item.key().store_id != self.store_id {
            return Err(Error::StoreMismatch {
                expected: self.store_id.clone(),
                actual: item.key().store_id.clone(),
            });
        }
        Ok(())
    }

    /// Mark `item` as handed to the remote system. See [`AuditQueue::begin`].
    pub fn begin(&mut self, item: &SyncItem) -> Result<bool> {
        self.check_owner(item)?;
        Ok(self.queue.begin(item))
    }

    /// Apply a remote acknowledgment for `item`.
    ///
    /// Writes the remote id, if one was assigned, to the row, then removes the
    /// queue entry unless it was replaced in the meantime. Once nothing is
    /// left to send for a deleted row its tombstone is dropped too. Returns
    /// whether the entry was removed.
    pub fn acknowledge(&mut self, item: &SyncItem, remote_id: Option<RemoteRowId>) -> Result<bool> {
        self.check_owner(item)?;
        let key = item.key().clone();

        if let Some(remote) = &remote_id {
            if let Some(row) = self
                .layers
                .get_mut(&key.layer_id)
                .and_then(|l| l.get_mut(key.local_row_id))
            {
                row.remote_id = Some(remote.clone());
            }
        }

        let removed = self.queue.acknowledge(item, remote_id.as_ref());
        if removed {
            if let Some(layer) = self.layers.get_mut(&key.layer_id) {
                if layer.get(key.local_row_id).is_some_and(|row| row.deleted) {
                    layer.remove(key.local_row_id);
                }
            }
        }
        Ok(removed)
    }

    /// Return `item` to the queue after a failed attempt.
    pub fn abort(&mut self, item: &SyncItem) -> Result<()> {
        self.check_owner(item)?;
        self.queue.abort(item);
        Ok(())
    }

    /// Drop every pending mutation.
    pub fn clear_pending(&mut self) {
        self.queue.clear();
    }

    /// Export the store state as a snapshot.
    pub fn export_state(&self) -> crate::snapshot::StoreSnapshot {
        let mut snapshot = crate::snapshot::StoreSnapshot::new(self.store_id.clone());
        snapshot.syncable = self.syncable;
        snapshot.next_row_id = self.next_row_id;

        for (name, layer) in &self.layers {
            let rows = snapshot.layers.entry(name.clone()).or_default();
            for row in layer.all_rows() {
                rows.insert(row.local_id, row.clone());
            }
        }
        snapshot.pending = self
            .queue
            .entries()
            .map(|entry| AuditEntry {
                in_flight: false,
                ..entry.clone()
            })
            .collect();
        snapshot
    }

    /// Replace this store's state with a snapshot.
    ///
    /// In-flight markers are not restored: every pending item is ready again.
    pub fn import_state(&mut self, snapshot: crate::snapshot::StoreSnapshot) -> Result<()> {
        if snapshot.store_id != self.store_id {
            return Err(Error::StoreMismatch {
                expected: self.store_id.clone(),
                actual: snapshot.store_id,
            });
        }
        snapshot.validate()?;

        let queue = AuditQueue::from_entries(snapshot.pending)?;
        let mut layers = HashMap::new();
        for (name, rows) in snapshot.layers {
            let mut layer = Layer::new();
            for row in rows.into_values() {
                layer.insert(row);
            }
            layers.insert(name, layer);
        }

        self.syncable = snapshot.syncable;
        self.next_row_id = snapshot.next_row_id;
        self.layers = layers;
        self.queue = queue;
        Ok(())
    }
}

/// Query builder for filtering rows.
pub struct QueryBuilder<'a> {
    layer: &'a Layer,
    include_deleted: bool,
}

impl<'a> QueryBuilder<'a> {
    fn new(layer: &'a Layer) -> Self {
        Self {
            layer,
            include_deleted: false,
        }
    }

    /// Include deleted rows in results.
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Rows matching the query, ordered by local ID.
    pub fn all(self) -> Vec<&'a FeatureRow> {
        let mut rows: Vec<_> = if self.include_deleted {
            self.layer.all_rows().collect()
        } else {
            self.layer.active_rows().collect()
        };
        rows.sort_by_key(|r| r.local_id);
        rows
    }

    /// Rows never acknowledged by the remote system.
    pub fn unsynced(self) -> Vec<&'a FeatureRow> {
        self.filter(|r| !r.is_synced())
    }

    /// Count matching rows.
    pub fn count(self) -> usize {
        if self.include_deleted {
            self.layer.all_rows().count()
        } else {
            self.layer.len()
        }
    }

    /// Filter rows by predicate.
    pub fn filter<F>(self, predicate: F) -> Vec<&'a FeatureRow>
    where
        F: Fn(&FeatureRow) -> bool,
    {
        self.all().into_iter().filter(|r| predicate(r)).collect()
    }
}

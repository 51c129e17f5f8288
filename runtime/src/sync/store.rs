//! Local stores as seen by the sync engine.

use std::fmt;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock, RwLockReadGuard};

use fieldsync_engine::{
    FeatureRef, FeatureRow, FeatureStore, LayerId, LocalRowId, RemoteRowId, StoreId,
    StoreSnapshot, SyncItem, SyncOperation,
};

const EDIT_CHANNEL_CAPACITY: usize = 256;

/// A local mutation that was recorded for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEdit {
    pub store_id: StoreId,
    pub feature: FeatureRef,
    pub operation: SyncOperation,
}

/// A store whose pending mutations the sync engine can drain.
pub trait SyncableStore: Send + Sync + 'static {
    fn store_id(&self) -> &StoreId;

    /// Pending items not already in flight, in FIFO order.
    fn ready_items(&self) -> BoxFuture<'_, Vec<SyncItem>>;

    /// Claim `item` for sending. `false` if it was replaced or removed.
    fn begin<'a>(&'a self, item: &'a SyncItem) -> BoxFuture<'a, bool>;

    /// Apply a successful send. Returns whether the queue entry was removed.
    fn acknowledge<'a>(
        &'a self,
        item: &'a SyncItem,
        remote_id: Option<RemoteRowId>,
    ) -> BoxFuture<'a, fieldsync_engine::error::Result<bool>>;

    /// Release `item` after a failed send.
    fn abort<'a>(&'a self, item: &'a SyncItem) -> BoxFuture<'a, ()>;

    fn pending_count(&self) -> BoxFuture<'_, usize>;

    /// Edits recorded from now on.
    fn edits(&self) -> broadcast::Receiver<StoreEdit>;
}

/// An in-memory [`FeatureStore`] shared between editors and the sync
/// engine.
pub struct LocalStore {
    store_id: StoreId,
    store: RwLock<FeatureStore>,
    edits: broadcast::Sender<StoreEdit>,
}

impl LocalStore {
    pub fn new(store: FeatureStore) -> Self {
        let (edits, _) = broadcast::channel(EDIT_CHANNEL_CAPACITY);
        Self {
            store_id: store.store_id().clone(),
            store: RwLock::new(store),
            edits,
        }
    }

    /// A syncable store with the given layers.
    pub fn with_layers<I, L>(store_id: impl Into<StoreId>, layers: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<LayerId>,
    {
        let mut store = FeatureStore::new(store_id);
        for layer in layers {
            store.add_layer(layer);
        }
        Self::new(store)
    }

    pub fn id(&self) -> &StoreId {
        &self.store_id
    }

    pub async fn insert(
        &self,
        layer: &str,
        properties: Value,
    ) -> fieldsync_engine::error::Result<FeatureRef> {
        let feature = self.store.write().await.insert(layer, properties, now())?;
        self.announce(&feature, SyncOperation::Create).await;
        Ok(feature)
    }

    pub async fn update(
        &self,
        layer: &str,
        id: LocalRowId,
        properties: Value,
    ) -> fieldsync_engine::error::Result<FeatureRef> {
        let feature = self
            .store
            .write()
            .await
            .update(layer, id, properties, now())?;
        self.announce(&feature, SyncOperation::Update).await;
        Ok(feature)
    }

    pub async fn delete(
        &self,
        layer: &str,
        id: LocalRowId,
    ) -> fieldsync_engine::error::Result<FeatureRef> {
        let feature = self.store.write().await.delete(layer, id, now())?;
        self.announce(&feature, SyncOperation::Delete).await;
        Ok(feature)
    }

    pub async fn get(&self, layer: &str, id: LocalRowId) -> Option<FeatureRow> {
        self.store.read().await.get(layer, id).cloned()
    }

    /// Read access to the whole store, for queries.
    pub async fn read(&self) -> RwLockReadGuard<'_, FeatureStore> {
        self.store.read().await
    }

    pub async fn pending(&self) -> Vec<SyncItem> {
        self.store.read().await.pending().cloned().collect()
    }

    pub async fn export_state(&self) -> StoreSnapshot {
        self.store.read().await.export_state()
    }

    pub async fn import_state(
        &self,
        snapshot: StoreSnapshot,
    ) -> fieldsync_engine::error::Result<()> {
        self.store.write().await.import_state(snapshot)
    }

    async fn announce(&self, feature: &FeatureRef, operation: SyncOperation) {
        if !self.store.read().await.is_syncable() {
            return;
        }
        let _ = self.edits.send(StoreEdit {
            store_id: self.store_id.clone(),
            feature: feature.clone(),
            operation,
        });
    }
}

impl SyncableStore for LocalStore {
    fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    fn ready_items(&self) -> BoxFuture<'_, Vec<SyncItem>> {
        Box::pin(async move { self.store.read().await.ready().cloned().collect() })
    }

    fn begin<'a>(&'a self, item: &'a SyncItem) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match self.store.write().await.begin(item) {
                Ok(claimed) => claimed,
                Err(err) => {
                    tracing::warn!(store = %self.store_id, error = %err, "cannot claim item");
                    false
                }
            }
        })
    }

    fn acknowledge<'a>(
        &'a self,
        item: &'a SyncItem,
        remote_id: Option<RemoteRowId>,
    ) -> BoxFuture<'a, fieldsync_engine::error::Result<bool>> {
        Box::pin(async move { self.store.write().await.acknowledge(item, remote_id) })
    }

    fn abort<'a>(&'a self, item: &'a SyncItem) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Err(err) = self.store.write().await.abort(item) {
                tracing::warn!(store = %self.store_id, error = %err, "cannot release item");
            }
        })
    }

    fn pending_count(&self) -> BoxFuture<'_, usize> {
        Box::pin(async move { self.store.read().await.pending_count() })
    }

    fn edits(&self) -> broadcast::Receiver<StoreEdit> {
        self.edits.subscribe()
    }
}

impl fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStore")
            .field("store_id", &self.store_id)
            .finish_non_exhaustive()
    }
}

fn now() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

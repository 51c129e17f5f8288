//! Registry of the device's feature stores.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;

use fieldsync_engine::graph::SC_DATA_SERVICE;
use fieldsync_engine::{ServiceId, StoreId};

use crate::error::Result;
use crate::graph::Service;
use crate::sync::LocalStore;

#[derive(Default)]
pub struct DataService {
    stores: DashMap<StoreId, Arc<LocalStore>>,
}

impl DataService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `store`, replacing any store with the same id.
    pub fn open_store(&self, store: LocalStore) -> Arc<LocalStore> {
        let store = Arc::new(store);
        self.stores.insert(store.id().clone(), Arc::clone(&store));
        tracing::debug!(store = %store.id(), "store opened");
        store
    }

    pub fn store(&self, store_id: &str) -> Option<Arc<LocalStore>> {
        self.stores.get(store_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Every open store, ordered by id.
    pub fn stores(&self) -> Vec<Arc<LocalStore>> {
        let mut stores: Vec<_> = self
            .stores
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        stores.sort_by(|a, b| a.id().cmp(b.id()));
        stores
    }
}

impl Service for DataService {
    fn id(&self) -> ServiceId {
        ServiceId::new(SC_DATA_SERVICE)
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tracing::info!(stores = self.stores.len(), "data stores ready");
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

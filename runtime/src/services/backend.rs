//! The backend service: connectivity plus sync.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use fieldsync_engine::envelope::{ACTION_CONFIG, ACTION_FETCH_CONFIG};
use fieldsync_engine::graph::{
    SC_AUTH_SERVICE, SC_BACKEND_SERVICE, SC_CONFIG_SERVICE, SC_DATA_SERVICE, SC_SENSOR_SERVICE,
};
use fieldsync_engine::ServiceId;

use super::config::{ConfigService, RemoteSettings};
use super::data::DataService;
use super::sensor::SensorService;
use crate::context::RuntimeContext;
use crate::error::Result;
use crate::graph::Service;
use crate::sync::SyncEngine;
use crate::transport::ConnectivityTransport;

/// Topic the backend serves device settings on.
pub const CONFIG_REQUEST_TOPIC: &str = "backend/config";

/// Brings up the broker connection and the sync engine once auth, config,
/// data and sensor services are running.
///
/// Arming sync and requesting remote settings happen at the end of `start`,
/// just before the node moves through `Started` to `Running`. Both only act
/// once the broker connects. If a stop cancels the start instead, `stop`
/// disarms sync and drops the request.
pub struct BackendService {
    ctx: RuntimeContext,
    transport: ConnectivityTransport,
    engine: SyncEngine,
    config: Arc<ConfigService>,
    data: Arc<DataService>,
    sensor: Arc<SensorService>,
    config_fetch: Mutex<Option<JoinHandle<()>>>,
}

impl BackendService {
    pub fn new(
        ctx: RuntimeContext,
        transport: ConnectivityTransport,
        engine: SyncEngine,
        config: Arc<ConfigService>,
        data: Arc<DataService>,
        sensor: Arc<SensorService>,
    ) -> Self {
        Self {
            ctx,
            transport,
            engine,
            config,
            data,
            sensor,
            config_fetch: Mutex::new(None),
        }
    }

    pub fn transport(&self) -> &ConnectivityTransport {
        &self.transport
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }
}

impl Service for BackendService {
    fn id(&self) -> ServiceId {
        ServiceId::new(SC_BACKEND_SERVICE)
    }

    fn dependencies(&self) -> Vec<ServiceId> {
        [
            SC_AUTH_SERVICE,
            SC_CONFIG_SERVICE,
            SC_DATA_SERVICE,
            SC_SENSOR_SERVICE,
        ]
        .into_iter()
        .map(ServiceId::new)
        .collect()
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.transport.start().await;

            for store in self.data.stores() {
                self.engine.add_store(store).await;
            }
            self.engine.add_store(self.sensor.store()).await;
            self.engine.arm().await;

            let fetch = self.ctx.net().spawn(fetch_remote_config(
                self.transport.clone(),
                Arc::clone(&self.config),
                self.ctx.config().device_id.clone(),
            ));
            if let Some(previous) = self.config_fetch.lock().await.replace(fetch) {
                previous.abort();
            }
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(fetch) = self.config_fetch.lock().await.take() {
                fetch.abort();
            }
            self.engine.disarm().await;
            self.transport.stop().await;
            Ok(())
        })
    }

    fn pause(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.engine.disarm().await;
            tracing::info!("backend paused");
            Ok(())
        })
    }

    fn resume(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            // Arming drains every store if the gate is already open.
            self.engine.arm().await;
            tracing::info!("backend resumed");
            Ok(())
        })
    }
}

/// Ask the backend for device settings once connected. A failed attempt
/// is repeated after the next reconnect.
async fn fetch_remote_config(
    transport: ConnectivityTransport,
    config: Arc<ConfigService>,
    device_id: String,
) {
    let mut state = transport.connection_state();
    let mut reconnects = transport.reconnects();
    let payload = json!({ "deviceId": device_id }).to_string();

    loop {
        if state.wait_for(|connected| *connected).await.is_err() {
            return;
        }
        let generation = *reconnects.borrow_and_update();

        match transport
            .request(CONFIG_REQUEST_TOPIC, ACTION_FETCH_CONFIG, payload.clone())
            .await
        {
            Ok(reply) if reply.action == ACTION_CONFIG => {
                match RemoteSettings::from_payload(&reply.payload) {
                    Ok(settings) => config.apply_remote(settings),
                    Err(err) => tracing::warn!(error = %err, "malformed remote settings ignored"),
                }
                return;
            }
            Ok(reply) => {
                tracing::warn!(action = reply.action, payload = %reply.payload, "config fetch refused");
            }
            Err(err) => tracing::warn!(error = %err, "config fetch failed"),
        }

        if reconnects
            .wait_for(|current| *current > generation)
            .await
            .is_err()
        {
            return;
        }
    }
}

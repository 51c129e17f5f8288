//! Wiring of the standard service graph.

use std::sync::Arc;

use fieldsync_engine::graph::SC_BACKEND_SERVICE;

use crate::auth::{AuthSession, AuthStrategy, HttpAuthStrategy, MemoryCredentialCache};
use crate::context::RuntimeContext;
use crate::error::Result;
use crate::graph::ServiceGraph;
use crate::services::{AuthService, BackendService, ConfigService, DataService, SensorService};
use crate::sync::{HttpBackend, LocalStore, RemoteSink, SyncEngine};
use crate::transport::{Broker, ConnectivityTransport, MemoryBroker, TransportOptions};

/// A fully wired client runtime.
pub struct Runtime {
    pub ctx: RuntimeContext,
    pub graph: ServiceGraph,
    pub auth: AuthSession,
    pub transport: ConnectivityTransport,
    pub sync: SyncEngine,
    pub config: Arc<ConfigService>,
    pub data: Arc<DataService>,
    pub sensor: Arc<SensorService>,
    pub backend: Arc<BackendService>,
}

impl Runtime {
    pub fn builder(ctx: RuntimeContext) -> RuntimeBuilder {
        RuntimeBuilder {
            ctx,
            broker: None,
            strategy: None,
            sink: None,
            stores: Vec::new(),
        }
    }

    /// Start the backend service and everything it depends on.
    pub async fn start(&self) -> Result<()> {
        self.graph.start(SC_BACKEND_SERVICE).await?;
        Ok(())
    }

    /// Stop every service, dependents first.
    pub async fn shutdown(&self) -> Result<()> {
        self.graph.stop_all().await?;
        Ok(())
    }
}

/// Builder for [`Runtime`]. Collaborators left unset fall back to the
/// HTTP backend, HTTP login with an in-memory credential cache, and the
/// in-process broker.
pub struct RuntimeBuilder {
    ctx: RuntimeContext,
    broker: Option<Arc<dyn Broker>>,
    strategy: Option<Arc<dyn AuthStrategy>>,
    sink: Option<Arc<dyn RemoteSink>>,
    stores: Vec<LocalStore>,
}

impl RuntimeBuilder {
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn auth_strategy(mut self, strategy: Arc<dyn AuthStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn remote_sink(mut self, sink: Arc<dyn RemoteSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Add a data store to sync.
    pub fn store(mut self, store: LocalStore) -> Self {
        self.stores.push(store);
        self
    }

    pub async fn build(self) -> Result<Runtime> {
        let ctx = self.ctx;
        let config = Arc::clone(ctx.config());
        let base_url = config.backend.base_url();

        let strategy: Arc<dyn AuthStrategy> = match self.strategy {
            Some(strategy) => strategy,
            None => Arc::new(HttpAuthStrategy::new(
                &base_url,
                config.request_timeout,
                Arc::new(MemoryCredentialCache::new()),
            )?),
        };
        let auth = AuthSession::new(ctx.clone(), strategy);

        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(MemoryBroker::new()) as Arc<dyn Broker>);
        let transport = ConnectivityTransport::new(
            ctx.clone(),
            broker,
            auth.clone(),
            TransportOptions::from_config(&config),
        );

        let sink: Arc<dyn RemoteSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(HttpBackend::new(
                &base_url,
                config.request_timeout,
                auth.clone(),
            )?),
        };
        let sync = SyncEngine::new(ctx.clone(), sink, transport.connection_state(), auth.status());

        let config_service = Arc::new(ConfigService::new(ctx.clone()));
        let data = Arc::new(DataService::new());
        for store in self.stores {
            data.open_store(store);
        }
        let sensor = Arc::new(SensorService::new());
        let auth_service = Arc::new(AuthService::new(ctx.clone(), auth.clone()));
        let backend = Arc::new(BackendService::new(
            ctx.clone(),
            transport.clone(),
            sync.clone(),
            Arc::clone(&config_service),
            Arc::clone(&data),
            Arc::clone(&sensor),
        ));

        let graph = ServiceGraph::new();
        graph.register(config_service.clone()).await?;
        graph.register(data.clone()).await?;
        graph.register(sensor.clone()).await?;
        graph.register(auth_service).await?;
        graph.register(backend.clone()).await?;

        Ok(Runtime {
            ctx,
            graph,
            auth,
            transport,
            sync,
            config: config_service,
            data,
            sensor,
            backend,
        })
    }
}

//! Configuration service.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

use fieldsync_engine::graph::SC_CONFIG_SERVICE;
use fieldsync_engine::ServiceId;

use crate::config::Config;
use crate::context::RuntimeContext;
use crate::error::{Result, RuntimeError};
use crate::graph::Service;

/// Device settings served by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteSettings(pub Map<String, Value>);

impl RemoteSettings {
    /// Parse the payload of a config reply. Must be a JSON object.
    pub fn from_payload(payload: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Holds the startup configuration and the settings fetched remotely.
pub struct ConfigService {
    ctx: RuntimeContext,
    remote: watch::Sender<Option<RemoteSettings>>,
}

impl ConfigService {
    pub fn new(ctx: RuntimeContext) -> Self {
        let (remote, _) = watch::channel(None);
        Self { ctx, remote }
    }

    pub fn config(&self) -> &Arc<Config> {
        self.ctx.config()
    }

    /// Base URL of the backend.
    pub fn endpoint(&self) -> String {
        self.ctx.config().backend.base_url()
    }

    /// Latest remote settings; `None` until the first successful fetch.
    pub fn remote_settings(&self) -> watch::Receiver<Option<RemoteSettings>> {
        self.remote.subscribe()
    }

    pub fn apply_remote(&self, settings: RemoteSettings) {
        tracing::info!(keys = settings.len(), "remote settings applied");
        self.remote.send_replace(Some(settings));
    }
}

impl Service for ConfigService {
    fn id(&self) -> ServiceId {
        ServiceId::new(SC_CONFIG_SERVICE)
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let config = self.ctx.config();
            if config.backend.host.trim().is_empty() {
                return Err(RuntimeError::Service("backend host is empty".to_string()));
            }
            if config.device_id.trim().is_empty() {
                return Err(RuntimeError::Service("device id is empty".to_string()));
            }
            tracing::info!(
                endpoint = %self.endpoint(),
                device_id = %config.device_id,
                "configuration loaded"
            );
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_must_be_an_object() {
        let settings = RemoteSettings::from_payload(r#"{"uploadIntervalSecs": 30}"#).unwrap();
        assert_eq!(settings.get("uploadIntervalSecs"), Some(&Value::from(30)));
        assert!(RemoteSettings::from_payload("[1, 2]").is_err());
    }

    #[tokio::test]
    async fn rejects_empty_device_id() {
        let config = Config {
            device_id: " ".into(),
            ..Config::default()
        };
        let service = ConfigService::new(RuntimeContext::for_current(config).unwrap());
        assert!(service.start().await.is_err());
    }

    #[tokio::test]
    async fn publishes_remote_settings() {
        let service = ConfigService::new(RuntimeContext::for_current(Config::default()).unwrap());
        let rx = service.remote_settings();
        assert!(rx.borrow().is_none());

        service.apply_remote(RemoteSettings::from_payload(r#"{"a": 1}"#).unwrap());
        assert_eq!(rx.borrow().as_ref().map(RemoteSettings::len), Some(1));
    }
}

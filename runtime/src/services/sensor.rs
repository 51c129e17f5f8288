//! Sensor observations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use fieldsync_engine::graph::SC_SENSOR_SERVICE;
use fieldsync_engine::{FeatureRef, ServiceId};

use crate::error::{Result, RuntimeError};
use crate::graph::Service;
use crate::sync::LocalStore;

pub const SENSOR_STORE: &str = "sensors";
pub const OBSERVATION_LAYER: &str = "observations";

/// One measurement taken by an attached sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub sensor: String,
    pub value: f64,
    pub unit: String,
    /// Longitude, latitude
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<[f64; 2]>,
    pub taken_at: DateTime<Utc>,
}

/// Records sensor readings into a syncable store.
pub struct SensorService {
    store: Arc<LocalStore>,
    running: AtomicBool,
}

impl SensorService {
    pub fn new() -> Self {
        Self {
            store: Arc::new(LocalStore::with_layers(SENSOR_STORE, [OBSERVATION_LAYER])),
            running: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> Arc<LocalStore> {
        Arc::clone(&self.store)
    }

    /// Store a reading. Only accepted while the service runs.
    pub async fn record(&self, reading: &SensorReading) -> Result<FeatureRef> {
        if !self.running.load(Ordering::Acquire) {
            return Err(RuntimeError::Service(
                "sensor service is not running".to_string(),
            ));
        }
        let properties = serde_json::to_value(reading)?;
        let feature = self.store.insert(OBSERVATION_LAYER, properties).await?;
        tracing::debug!(sensor = %reading.sensor, key = %feature.key, "reading recorded");
        Ok(feature)
    }
}

impl Default for SensorService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for SensorService {
    fn id(&self) -> ServiceId {
        ServiceId::new(SC_SENSOR_SERVICE)
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.running.store(true, Ordering::Release);
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.running.store(false, Ordering::Release);
            Ok(())
        })
    }
}

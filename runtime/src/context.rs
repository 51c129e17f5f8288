//! Shared runtime context handed to every service.
//!
//! Holds the immutable configuration, the fault sink, and the handle of the
//! tokio runtime reserved for network IO. Services clone the context; all
//! fields are cheap to clone.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinError;

use crate::config::Config;

const FAULT_CHANNEL_CAPACITY: usize = 64;

/// An unexpected failure reported by a background task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fault {
    pub source: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Error-reporting sink. Faults are logged and multicast to subscribers.
#[derive(Clone)]
pub struct FaultSink {
    tx: broadcast::Sender<Fault>,
}

impl FaultSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Record a fault from `source`.
    pub fn report(&self, source: &str, error: impl fmt::Display) {
        let fault = Fault {
            source: source.to_string(),
            message: error.to_string(),
            at: Utc::now(),
        };
        tracing::error!(source = %fault.source, "{}", fault.message);
        // No subscribers is fine; the log line above is the record.
        let _ = self.tx.send(fault);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Fault> {
        self.tx.subscribe()
    }
}

impl Default for FaultSink {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FaultSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultSink")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

/// Configuration, fault sink and network execution context.
#[derive(Clone, Debug)]
pub struct RuntimeContext {
    config: Arc<Config>,
    faults: FaultSink,
    net: Handle,
}

impl RuntimeContext {
    /// Create a context whose network work runs on `net`.
    pub fn new(config: Config, net: Handle) -> Self {
        Self {
            config: Arc::new(config),
            faults: FaultSink::new(),
            net,
        }
    }

    /// Create a context that runs network work on the current tokio runtime.
    pub fn for_current(config: Config) -> crate::error::Result<Self> {
        Ok(Self::new(config, Handle::try_current()?))
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn faults(&self) -> &FaultSink {
        &self.faults
    }

    /// Handle of the network runtime.
    pub fn net(&self) -> &Handle {
        &self.net
    }

    /// Run `fut` on the network runtime and wait for its output.
    pub async fn run_network<F>(&self, fut: F) -> Result<F::Output, JoinError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.net.spawn(fut).await
    }
}

/// Resolves once `shutdown` flips to `true` or its sender is dropped.
pub(crate) async fn shutdown_requested(shutdown: &mut tokio::sync::watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

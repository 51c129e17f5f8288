//! Status event subscriptions.

use std::collections::VecDeque;

use tokio::sync::broadcast::{self, error::RecvError};

use fieldsync_engine::{ServiceId, ServiceStatus, ServiceStatusEvent};

/// A subscription to service status changes.
///
/// Yields one synthetic event per node registered at subscription time,
/// carrying its current status, then every live transition. Dropping the
/// subscription unsubscribes.
#[derive(Debug)]
pub struct StatusSubscription {
    replay: VecDeque<ServiceStatusEvent>,
    live: broadcast::Receiver<ServiceStatusEvent>,
}

impl StatusSubscription {
    pub(crate) fn new(
        replay: Vec<ServiceStatusEvent>,
        live: broadcast::Receiver<ServiceStatusEvent>,
    ) -> Self {
        Self {
            replay: replay.into(),
            live,
        }
    }

    /// Next event, or `None` once the graph is gone.
    pub async fn recv(&mut self) -> Option<ServiceStatusEvent> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        loop {
            match self.live.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "status subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event without waiting.
    pub fn try_recv(&mut self) -> Option<ServiceStatusEvent> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        loop {
            match self.live.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "status subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// Wait until `service` reports `status`.
    pub async fn wait_for(&mut self, service: &str, status: ServiceStatus) -> bool {
        while let Some(event) = self.recv().await {
            if event.service_id.as_str() == service && event.status == status {
                return true;
            }
        }
        false
    }

    /// Next event concerning `service`.
    pub async fn next_for(&mut self, service: &ServiceId) -> Option<ServiceStatus> {
        while let Some(event) = self.recv().await {
            if &event.service_id == service {
                return Some(event.status);
            }
        }
        None
    }
}

//! Dependency-ordered service orchestration.
//!
//! [`ServiceGraph`] owns every registered [`Service`] and its node status.
//! Start plans come from the engine's [`DependencyGraph`], so a missing
//! dependency or a cycle is detected before any service is touched. One
//! orchestration (start, stop, restart) runs at a time; status reads and
//! subscriptions never wait for it.

mod events;
mod service;

pub use events::StatusSubscription;
pub use service::Service;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use fieldsync_engine::{
    DependencyGraph, GraphError, GraphResult, ServiceId, ServiceNode, ServiceStatus,
    ServiceStatusEvent,
};

const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Registry and orchestrator of lifecycle-managed services.
///
/// Cloning yields another handle to the same graph.
#[derive(Clone)]
pub struct ServiceGraph {
    inner: Arc<GraphInner>,
}

struct GraphInner {
    state: Mutex<GraphState>,
    /// Serializes start/stop/restart orchestration
    ops: Mutex<()>,
    events: broadcast::Sender<ServiceStatusEvent>,
}

#[derive(Default)]
struct GraphState {
    graph: DependencyGraph,
    services: HashMap<ServiceId, Arc<dyn Service>>,
    watches: HashMap<ServiceId, watch::Sender<ServiceStatus>>,
    stop_requested: HashSet<ServiceId>,
}

impl GraphInner {
    /// Apply a status change and publish it. The event is sent while the
    /// state lock is held so subscribers never see a gap after their replay.
    async fn transition(&self, id: &ServiceId, next: ServiceStatus) -> GraphResult<()> {
        let mut state = self.state.lock().await;
        Self::transition_locked(&mut state, &self.events, id, next)
    }

    fn transition_locked(
        state: &mut GraphState,
        events: &broadcast::Sender<ServiceStatusEvent>,
        id: &ServiceId,
        next: ServiceStatus,
    ) -> GraphResult<()> {
        state.graph.set_status(id.as_str(), next)?;
        if let Some(watch) = state.watches.get(id) {
            watch.send_replace(next);
        }
        let _ = events.send(ServiceStatusEvent::new(id.clone(), next));
        tracing::info!(service = %id, status = %next, "service status changed");
        Ok(())
    }

    async fn mark_error(&self, id: &ServiceId) {
        let mut state = self.state.lock().await;
        match state.graph.status(id.as_str()) {
            Some(ServiceStatus::Error) | None => {}
            Some(_) => {
                let _ = Self::transition_locked(&mut state, &self.events, id, ServiceStatus::Error);
            }
        }
    }

    async fn take_stop_request(&self, id: &ServiceId) -> bool {
        self.state.lock().await.stop_requested.remove(id)
    }
}

impl ServiceGraph {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(GraphInner {
                state: Mutex::new(GraphState::default()),
                ops: Mutex::new(()),
                events,
            }),
        }
    }

    /// Add a service. Its node reports `Unregistered` until first started.
    ///
    /// Fails with `DuplicateService` if the id is taken, and with
    /// `CyclicDependency` if the new node closes a cycle among registered
    /// services; the graph is unchanged in both cases.
    pub async fn register(&self, service: Arc<dyn Service>) -> GraphResult<()> {
        let id = service.id();
        let mut state = self.inner.state.lock().await;
        state.graph.insert(id.clone(), service.dependencies())?;

        if let Some(path) = state.graph.find_cycle_through(id.as_str()) {
            state.graph.remove(id.as_str());
            return Err(GraphError::CyclicDependency { service: id, path });
        }

        let (watch, _) = watch::channel(ServiceStatus::Unregistered);
        state.watches.insert(id.clone(), watch);
        state.services.insert(id.clone(), service);
        tracing::debug!(service = %id, "service registered");
        Ok(())
    }

    /// Stop `id` if it is up, then remove it. No-op for unknown ids.
    pub async fn unregister(&self, id: &str) -> GraphResult<()> {
        let _op = self.inner.ops.lock().await;

        let status = match self.inner.state.lock().await.graph.status(id) {
            Some(status) => status,
            None => return Ok(()),
        };
        if status.is_up() || status == ServiceStatus::Error {
            if let Err(err) = self.stop_locked(id, true).await {
                tracing::warn!(service = %id, error = %err, "stop during unregister failed");
            }
        }

        let mut state = self.inner.state.lock().await;
        let Some(node) = state.graph.remove(id) else {
            return Ok(());
        };
        state.services.remove(id);
        state.stop_requested.remove(id);
        if let Some(watch) = state.watches.remove(id) {
            watch.send_replace(ServiceStatus::Unregistered);
        }
        let _ = self.inner.events.send(ServiceStatusEvent::new(
            node.id.clone(),
            ServiceStatus::Unregistered,
        ));
        tracing::info!(service = %node.id, "service unregistered");
        Ok(())
    }

    /// Start `id` after its not-yet-running dependencies, depth-first.
    pub async fn start(&self, id: &str) -> GraphResult<()> {
        let _op = self.inner.ops.lock().await;
        self.start_locked(id).await
    }

    /// Start every registered service in registration order. Running
    /// services are skipped. Keeps going past failures and returns the
    /// first one.
    pub async fn start_all(&self) -> GraphResult<()> {
        let _op = self.inner.ops.lock().await;
        let ids = self.inner.state.lock().await.graph.ids().to_vec();

        let mut first_error = None;
        for id in ids {
            let status = self.inner.state.lock().await.graph.status(id.as_str());
            if matches!(status, Some(ServiceStatus::Running) | None) {
                continue;
            }
            if let Err(err) = self.start_locked(id.as_str()).await {
                tracing::warn!(service = %id, error = %err, "start_all: service did not start");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stop `id` without touching its dependents.
    ///
    /// A stop requested while `id` is still starting cancels the startup
    /// once the service's own `start` returns. A node in `Error` is left
    /// there; only [`restart`](Self::restart) clears it.
    pub async fn stop(&self, id: &str) -> GraphResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            match state.graph.status(id) {
                None => return Err(GraphError::UnknownService(ServiceId::new(id))),
                Some(ServiceStatus::Starting | ServiceStatus::Started) => {
                    state.stop_requested.insert(ServiceId::new(id));
                }
                Some(_) => {}
            }
        }
        let _op = self.inner.ops.lock().await;
        self.stop_locked(id, false).await
    }

    /// Stop every service, dependents before their dependencies.
    pub async fn stop_all(&self) -> GraphResult<()> {
        let _op = self.inner.ops.lock().await;
        let order = self.inner.state.lock().await.graph.topological_order();

        let mut first_error = None;
        for id in order.iter().rev() {
            if let Err(err) = self.stop_locked(id.as_str(), false).await {
                tracing::warn!(service = %id, error = %err, "stop_all: service did not stop");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stop then start `id`. The only way out of `Error`.
    pub async fn restart(&self, id: &str) -> GraphResult<()> {
        let _op = self.inner.ops.lock().await;
        self.stop_locked(id, true).await?;
        self.start_locked(id).await
    }

    /// Start `id` in the background.
    pub fn spawn_start(&self, id: impl Into<ServiceId>) -> JoinHandle<GraphResult<()>> {
        let graph = self.clone();
        let id = id.into();
        tokio::spawn(async move { graph.start(id.as_str()).await })
    }

    /// Forward a pause request to the service. The node status is unchanged.
    pub async fn pause(&self, id: &str) -> GraphResult<()> {
        let service = self.service(id).await?;
        service.pause().await.map_err(|e| GraphError::ServiceFailed {
            service: ServiceId::new(id),
            reason: e.to_string(),
        })
    }

    /// Forward a resume request to the service. The node status is unchanged.
    pub async fn resume(&self, id: &str) -> GraphResult<()> {
        let service = self.service(id).await?;
        service.resume().await.map_err(|e| GraphError::ServiceFailed {
            service: ServiceId::new(id),
            reason: e.to_string(),
        })
    }

    /// Subscribe to status changes, starting with the current status of
    /// every registered node.
    pub async fn status_events(&self) -> StatusSubscription {
        let state = self.inner.state.lock().await;
        let replay = state
            .graph
            .nodes()
            .map(|node| ServiceStatusEvent::new(node.id.clone(), node.status))
            .collect();
        StatusSubscription::new(replay, self.inner.events.subscribe())
    }

    /// Snapshot of a node.
    pub async fn node_for(&self, id: &str) -> Option<ServiceNode> {
        self.inner.state.lock().await.graph.get(id).cloned()
    }

    pub async fn status(&self, id: &str) -> Option<ServiceStatus> {
        self.inner.state.lock().await.graph.status(id)
    }

    /// Wait until `id` reaches `status`. Fails early if the node enters
    /// `Error` instead, or is unregistered. Has no timeout of its own.
    pub async fn wait_for(&self, id: &str, status: ServiceStatus) -> GraphResult<()> {
        let mut rx = self
            .inner
            .state
            .lock()
            .await
            .watches
            .get(id)
            .map(|watch| watch.subscribe())
            .ok_or_else(|| GraphError::UnknownService(ServiceId::new(id)))?;

        let reached = rx
            .wait_for(|current| {
                *current == status || (*current == ServiceStatus::Error && status != ServiceStatus::Error)
            })
            .await
            .map(|current| *current);

        match reached {
            Ok(current) if current == status => Ok(()),
            Ok(_) => Err(GraphError::ServiceFailed {
                service: ServiceId::new(id),
                reason: format!("entered error state while waiting for {status}"),
            }),
            Err(_) => Err(GraphError::UnknownService(ServiceId::new(id))),
        }
    }

    /// Wait until `id` is `Running`.
    pub async fn service_running(&self, id: &str) -> GraphResult<()> {
        self.wait_for(id, ServiceStatus::Running).await
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.graph.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.state.lock().await.graph.is_empty()
    }

    async fn service(&self, id: &str) -> GraphResult<Arc<dyn Service>> {
        self.inner
            .state
            .lock()
            .await
            .services
            .get(id)
            .cloned()
            .ok_or_else(|| GraphError::UnknownService(ServiceId::new(id)))
    }

    async fn start_locked(&self, id: &str) -> GraphResult<()> {
        let plan = self.inner.state.lock().await.graph.plan_start(id);
        let plan = match plan {
            Ok(plan) => plan,
            Err(err) => {
                self.reject_plan(id, &err).await;
                return Err(err);
            }
        };

        if plan.is_empty() {
            tracing::debug!(service = %id, "already running");
            return Ok(());
        }
        tracing::debug!(service = %plan.target, order = ?plan.order, "start plan");

        for step in &plan.order {
            match self.start_node(step).await {
                Ok(()) => {}
                Err(err @ GraphError::StartCancelled(_)) => return Err(err),
                Err(err) if *step == plan.target => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        service = %plan.target,
                        dependency = %step,
                        error = %err,
                        "dependency failed, abandoning start"
                    );
                    self.inner.mark_error(&plan.target).await;
                    return Err(GraphError::DependencyFailed {
                        service: plan.target.clone(),
                        dependency: step.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn reject_plan(&self, id: &str, err: &GraphError) {
        tracing::warn!(service = %id, error = %err, "start rejected");
        match err {
            GraphError::MissingDependency { service, .. } => {
                self.inner.mark_error(service).await;
                if service.as_str() != id {
                    self.inner.mark_error(&ServiceId::new(id)).await;
                }
            }
            GraphError::CyclicDependency { service, .. }
            | GraphError::DependencyFailed { service, .. } => {
                self.inner.mark_error(service).await;
            }
            _ => {}
        }
    }

    async fn start_node(&self, id: &ServiceId) -> GraphResult<()> {
        let service = {
            let mut state = self.inner.state.lock().await;
            state.stop_requested.remove(id);
            state
                .services
                .get(id)
                .cloned()
                .ok_or_else(|| GraphError::UnknownService(id.clone()))?
        };

        self.inner.transition(id, ServiceStatus::Starting).await?;
        if let Err(err) = service.start().await {
            tracing::warn!(service = %id, error = %err, "service failed to start");
            self.inner.transition(id, ServiceStatus::Error).await?;
            return Err(GraphError::ServiceFailed {
                service: id.clone(),
                reason: err.to_string(),
            });
        }
        self.inner.transition(id, ServiceStatus::Started).await?;

        if self.inner.take_stop_request(id).await {
            tracing::info!(service = %id, "start cancelled by stop request");
            self.stop_node(id, service.as_ref()).await?;
            return Err(GraphError::StartCancelled(id.clone()));
        }

        self.inner.transition(id, ServiceStatus::Running).await
    }

    /// `clear_error` lets the stop move a node out of `Error`.
    async fn stop_locked(&self, id: &str, clear_error: bool) -> GraphResult<()> {
        let (node_id, status, service) = {
            let state = self.inner.state.lock().await;
            let node = state
                .graph
                .get(id)
                .ok_or_else(|| GraphError::UnknownService(ServiceId::new(id)))?;
            let service = state
                .services
                .get(id)
                .cloned()
                .ok_or_else(|| GraphError::UnknownService(ServiceId::new(id)))?;
            (node.id.clone(), node.status, service)
        };

        match status {
            ServiceStatus::Unregistered | ServiceStatus::Stopped | ServiceStatus::Stopping => {
                tracing::debug!(service = %node_id, %status, "nothing to stop");
                Ok(())
            }
            ServiceStatus::Error if !clear_error => {
                tracing::debug!(service = %node_id, "failed service stays in error until restarted");
                Ok(())
            }
            _ => self.stop_node(&node_id, service.as_ref()).await,
        }
    }

    async fn stop_node(&self, id: &ServiceId, service: &dyn Service) -> GraphResult<()> {
        self.inner.transition(id, ServiceStatus::Stopping).await?;
        match service.stop().await {
            Ok(()) => self.inner.transition(id, ServiceStatus::Stopped).await,
            Err(err) => {
                tracing::warn!(service = %id, error = %err, "service failed to stop");
                self.inner.transition(id, ServiceStatus::Error).await?;
                Err(GraphError::ServiceFailed {
                    service: id.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }
}

impl Default for ServiceGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServiceGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceGraph")
            .field("subscribers", &self.inner.events.receiver_count())
            .finish_non_exhaustive()
    }
}

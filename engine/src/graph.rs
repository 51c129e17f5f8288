//! Service dependency graph.
//!
//! Pure bookkeeping for lifecycle-managed services: which services exist,
//! what each one depends on, and what state each one is in. The async
//! orchestrator in the runtime crate drives the actual start/stop calls and
//! asks this graph for plans and legal transitions.
//!
//! # State Transitions
//!
//! ```text
//! Unregistered ──→ Starting ──→ Started ──→ Running
//!                     │            │           │
//!                     └────────────┴───────────┴──→ Stopping ──→ Stopped
//!                                                      ↑            │
//!                    any state ──→ Error ──────────────┘            │
//!                                                                   │
//!                        Starting ←─────────────────────────────────┘
//! ```
//!
//! `Error` is left only through `Stopping`, which is what a restart does.

use crate::error::{GraphError, GraphResult};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Well-known service identifiers. They form the dependency contract
/// between components and must stay stable.
pub const SC_CONFIG_SERVICE: &str = "SC_CONFIG_SERVICE";
pub const SC_DATA_SERVICE: &str = "SC_DATA_SERVICE";
pub const SC_SENSOR_SERVICE: &str = "SC_SENSOR_SERVICE";
pub const SC_AUTH_SERVICE: &str = "SC_AUTH_SERVICE";
pub const SC_BACKEND_SERVICE: &str = "SC_BACKEND_SERVICE";

/// Opaque identifier of a registered service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ServiceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for ServiceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Lifecycle status of a service node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceStatus {
    /// Known to the graph but never started, or just removed from it
    Unregistered,
    Starting,
    /// `start` returned; not yet announced as running
    Started,
    Running,
    Stopping,
    Stopped,
    /// Failed; terminal until restarted
    Error,
}

impl ServiceStatus {
    /// Whether the graph may move a node from `self` to `next`.
    pub fn can_transition_to(self, next: ServiceStatus) -> bool {
        use ServiceStatus::*;
        match (self, next) {
            (_, Error) => self != Error,
            (Unregistered | Stopped, Starting) => true,
            (Starting, Started) => true,
            (Started, Running) => true,
            (Starting | Started | Running | Error, Stopping) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }

    /// Whether the service is between `Starting` and `Running` inclusive.
    pub fn is_up(self) -> bool {
        matches!(
            self,
            ServiceStatus::Starting | ServiceStatus::Started | ServiceStatus::Running
        )
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceStatus::Unregistered => "unregistered",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Started => "started",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// A registered service and its declared dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNode {
    pub id: ServiceId,
    /// Declared dependencies, deduplicated, in declaration order
    pub dependencies: Vec<ServiceId>,
    pub status: ServiceStatus,
}

/// One status change, as published on the status stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusEvent {
    pub service_id: ServiceId,
    pub status: ServiceStatus,
}

impl ServiceStatusEvent {
    pub fn new(service_id: ServiceId, status: ServiceStatus) -> Self {
        Self { service_id, status }
    }
}

/// The services to start, dependencies first, to bring `target` up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPlan {
    pub target: ServiceId,
    /// Nodes not yet running, in depth-first post-order. Ends with the
    /// target unless the target is already running.
    pub order: Vec<ServiceId>,
}

impl StartPlan {
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Registry of service nodes.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<ServiceId, ServiceNode>,
    /// Registration order
    order: Vec<ServiceId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node in the `Unregistered` status.
    ///
    /// Dependencies may name services that are not registered yet; that is
    /// only an error when the node is started.
    pub fn insert(
        &mut self,
        id: ServiceId,
        dependencies: impl IntoIterator<Item = ServiceId>,
    ) -> GraphResult<()> {
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateService(id));
        }

        let mut seen = HashSet::new();
        let dependencies = dependencies
            .into_iter()
            .filter(|dep| seen.insert(dep.clone()))
            .collect();

        self.order.push(id.clone());
        self.nodes.insert(
            id.clone(),
            ServiceNode {
                id,
                dependencies,
                status: ServiceStatus::Unregistered,
            },
        );
        Ok(())
    }

    /// Remove a node, returning it.
    pub fn remove(&mut self, id: &str) -> Option<ServiceNode> {
        let node = self.nodes.remove(id)?;
        self.order.retain(|other| other.as_str() != id);
        Some(node)
    }

    pub fn get(&self, id: &str) -> Option<&ServiceNode> {
        self.nodes.get(id)
    }

    pub fn status(&self, id: &str) -> Option<ServiceStatus> {
        self.nodes.get(id).map(|node| node.status)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> &[ServiceId] {
        &self.order
    }

    /// Registered nodes in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = &ServiceNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Registered nodes that declare `id` as a dependency.
    pub fn dependents(&self, id: &str) -> Vec<ServiceId> {
        self.nodes()
            .filter(|node| node.dependencies.iter().any(|dep| dep.as_str() == id))
            .map(|node| node.id.clone())
            .collect()
    }

    /// Move a node to `next`, returning its previous status.
    pub fn set_status(&mut self, id: &str, next: ServiceStatus) -> GraphResult<ServiceStatus> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownService(ServiceId::new(id)))?;

        let previous = node.status;
        if !previous.can_transition_to(next) {
            return Err(GraphError::InvalidTransition {
                service: node.id.clone(),
                from: previous,
                to: next,
            });
        }
        node.status = next;
        Ok(previous)
    }

    /// Find a dependency cycle passing through `id`, following registered
    /// nodes only. The returned path starts and ends with `id`.
    pub fn find_cycle_through(&self, id: &str) -> Option<Vec<ServiceId>> {
        let start = self.nodes.get(id)?;
        let mut path = vec![start.id.clone()];
        let mut visited = HashSet::new();
        if self.reaches(start, id, &mut path, &mut visited) {
            Some(path)
        } else {
            None
        }
    }

    fn reaches(
        &self,
        node: &ServiceNode,
        goal: &str,
        path: &mut Vec<ServiceId>,
        visited: &mut HashSet<ServiceId>,
    ) -> bool {
        for dep in &node.dependencies {
            path.push(dep.clone());
            if dep.as_str() == goal {
                return true;
            }
            if visited.insert(dep.clone()) {
                if let Some(next) = self.nodes.get(dep) {
                    if self.reaches(next, goal, path, visited) {
                        return true;
                    }
                }
            }
            path.pop();
        }
        false
    }

    /// Compute the start plan for `target`.
    ///
    /// The whole walk happens before anything is started, so a missing
    /// dependency or a cycle anywhere below the target is reported without
    /// side effects. Running nodes are not descended into.
    pub fn plan_start(&self, target: &str) -> GraphResult<StartPlan> {
        let node = self
            .nodes
            .get(target)
            .ok_or_else(|| GraphError::UnknownService(ServiceId::new(target)))?;

        if node.status == ServiceStatus::Error {
            return Err(GraphError::InvalidTransition {
                service: node.id.clone(),
                from: ServiceStatus::Error,
                to: ServiceStatus::Starting,
            });
        }

        let mut walk = Walk {
            target: node.id.clone(),
            stack: Vec::new(),
            done: HashSet::new(),
            order: Vec::new(),
        };
        self.visit(node, &mut walk)?;

        Ok(StartPlan {
            target: walk.target,
            order: walk.order,
        })
    }

    fn visit(&self, node: &ServiceNode, walk: &mut Walk) -> GraphResult<()> {
        if walk.done.contains(&node.id) {
            return Ok(());
        }
        if let Some(pos) = walk.stack.iter().position(|id| *id == node.id) {
            let mut path = walk.stack[pos..].to_vec();
            path.push(node.id.clone());
            return Err(GraphError::CyclicDependency {
                service: walk.target.clone(),
                path,
            });
        }
        if node.status == ServiceStatus::Running {
            walk.done.insert(node.id.clone());
            return Ok(());
        }
        if node.status == ServiceStatus::Error && node.id != walk.target {
            return Err(GraphError::DependencyFailed {
                service: walk.target.clone(),
                dependency: node.id.clone(),
            });
        }

        walk.stack.push(node.id.clone());
        for dep in &node.dependencies {
            let dep_node = self
                .nodes
                .get(dep)
                .ok_or_else(|| GraphError::MissingDependency {
                    service: node.id.clone(),
                    dependency: dep.clone(),
                })?;
            self.visit(dep_node, walk)?;
        }
        walk.stack.pop();

        walk.done.insert(node.id.clone());
        walk.order.push(node.id.clone());
        Ok(())
    }

    /// All registered ids, dependencies before dependents. Missing
    /// dependencies are ignored; ties keep registration order.
    pub fn topological_order(&self) -> Vec<ServiceId> {
        let mut done = HashSet::new();
        let mut order = Vec::with_capacity(self.order.len());
        for id in &self.order {
            self.collect(id, &mut done, &mut order);
        }
        order
    }

    fn collect(&self, id: &ServiceId, done: &mut HashSet<ServiceId>, order: &mut Vec<ServiceId>) {
        if !done.insert(id.clone()) {
            return;
        }
        if let Some(node) = self.nodes.get(id) {
            for dep in &node.dependencies {
                self.collect(dep, done, order);
            }
            order.push(id.clone());
        }
    }
}

struct Walk {
    target: ServiceId,
    stack: Vec<ServiceId>,
    done: HashSet<ServiceId>,
    order: Vec<ServiceId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<ServiceId> {
        names.iter().map(|n| ServiceId::new(*n)).collect()
    }

    fn graph(edges: &[(&str, &[&str])]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for (id, deps) in edges {
            graph.insert(ServiceId::new(*id), ids(deps)).unwrap();
        }
        graph
    }

    #[test]
    fn duplicate_registration() {
        let mut g = graph(&[("a", &[])]);
        let err = g.insert(ServiceId::new("a"), vec![]).unwrap_err();
        assert_eq!(err, GraphError::DuplicateService(ServiceId::new("a")));
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn plan_is_dependencies_first() {
        let g = graph(&[
            ("backend", &["auth", "data", "config"]),
            ("auth", &["config"]),
            ("data", &[]),
            ("config", &[]),
        ]);

        let plan = g.plan_start("backend").unwrap();
        assert_eq!(plan.order, ids(&["config", "auth", "data", "backend"]));
    }

    #[test]
    fn plan_skips_running_nodes() {
        let mut g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);
        for status in [
            ServiceStatus::Starting,
            ServiceStatus::Started,
            ServiceStatus::Running,
        ] {
            g.set_status("b", status).unwrap();
        }

        // b is running, so c is not descended into
        let plan = g.plan_start("a").unwrap();
        assert_eq!(plan.order, ids(&["a"]));
    }

    #[test]
    fn plan_missing_dependency() {
        let g = graph(&[("a", &["b"]), ("b", &["ghost"])]);
        let err = g.plan_start("a").unwrap_err();
        assert_eq!(
            err,
            GraphError::MissingDependency {
                service: ServiceId::new("b"),
                dependency: ServiceId::new("ghost"),
            }
        );
    }

    #[test]
    fn plan_detects_cycle() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        let err = g.plan_start("a").unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                service: ServiceId::new("a"),
                path: ids(&["a", "b", "c", "a"]),
            }
        );
    }

    #[test]
    fn plan_refuses_failed_target_and_dependency() {
        let mut g = graph(&[("a", &["b"]), ("b", &[])]);
        g.set_status("b", ServiceStatus::Error).unwrap();

        let err = g.plan_start("a").unwrap_err();
        assert!(matches!(err, GraphError::DependencyFailed { .. }));

        let err = g.plan_start("b").unwrap_err();
        assert!(matches!(err, GraphError::InvalidTransition { .. }));
    }

    #[test]
    fn cycle_through_new_node() {
        let g = graph(&[("a", &["b"]), ("b", &["a"]), ("c", &["a"])]);
        assert_eq!(g.find_cycle_through("a"), Some(ids(&["a", "b", "a"])));
        assert_eq!(g.find_cycle_through("c"), None);
    }

    #[test]
    fn transitions() {
        use ServiceStatus::*;
        assert!(Unregistered.can_transition_to(Starting));
        assert!(Started.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Error.can_transition_to(Stopping));
        assert!(!Error.can_transition_to(Starting));
        assert!(!Error.can_transition_to(Error));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Running));
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut g = graph(&[("a", &[])]);
        let err = g.set_status("a", ServiceStatus::Running).unwrap_err();
        assert!(matches!(err, GraphError::InvalidTransition { .. }));
        assert_eq!(g.status("a"), Some(ServiceStatus::Unregistered));
    }

    #[test]
    fn topological_order_and_dependents() {
        let g = graph(&[("a", &["b", "missing"]), ("c", &[]), ("b", &["c"])]);
        assert_eq!(g.topological_order(), ids(&["c", "b", "a"]));
        assert_eq!(g.dependents("b"), ids(&["a"]));
    }

    #[test]
    fn duplicate_dependencies_are_collapsed() {
        let g = graph(&[("a", &["b", "b"]), ("b", &[])]);
        assert_eq!(g.get("a").unwrap().dependencies, ids(&["b"]));
    }

    #[test]
    fn remove_keeps_registration_order() {
        let mut g = graph(&[("a", &[]), ("b", &[]), ("c", &[])]);
        assert!(g.remove("b").is_some());
        assert!(g.remove("b").is_none());
        assert_eq!(g.ids(), ids(&["a", "c"]).as_slice());
    }
}

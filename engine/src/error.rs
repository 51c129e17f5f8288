//! Error types for the fieldsync engine.

use crate::{LayerId, LocalRowId, ServiceId, StoreId};
use thiserror::Error;

/// Errors raised by feature stores, audit queues and snapshots.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Lookup errors
    #[error("layer not found: {0}")]
    LayerNotFound(LayerId),

    #[error("row not found: {layer}/{row}")]
    RowNotFound { layer: LayerId, row: LocalRowId },

    // Mutation errors
    #[error("operation on deleted row: {layer}/{row}")]
    RowDeleted { layer: LayerId, row: LocalRowId },

    #[error("feature belongs to store '{actual}', not '{expected}'")]
    StoreMismatch { expected: StoreId, actual: StoreId },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Result type for store and queue operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the service dependency graph.
///
/// Every variant is fatal to the affected node only; the rest of the graph
/// keeps its state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("service already registered: {0}")]
    DuplicateService(ServiceId),

    #[error("service '{service}' depends on unregistered service '{dependency}'")]
    MissingDependency {
        service: ServiceId,
        dependency: ServiceId,
    },

    #[error("dependency cycle: {}", format_path(.path))]
    CyclicDependency {
        service: ServiceId,
        path: Vec<ServiceId>,
    },

    #[error("unknown service: {0}")]
    UnknownService(ServiceId),

    #[error("service '{service}' cannot start: dependency '{dependency}' failed")]
    DependencyFailed {
        service: ServiceId,
        dependency: ServiceId,
    },

    #[error("service '{service}' failed: {reason}")]
    ServiceFailed { service: ServiceId, reason: String },

    #[error("start of '{0}' was cancelled by a stop request")]
    StartCancelled(ServiceId),

    #[error("service '{service}' cannot move from {from} to {to}")]
    InvalidTransition {
        service: ServiceId,
        from: crate::ServiceStatus,
        to: crate::ServiceStatus,
    },
}

impl GraphError {
    /// The node this error should be attributed to.
    pub fn service(&self) -> &ServiceId {
        match self {
            GraphError::DuplicateService(id)
            | GraphError::UnknownService(id)
            | GraphError::StartCancelled(id) => id,
            GraphError::MissingDependency { service, .. }
            | GraphError::DependencyFailed { service, .. }
            | GraphError::ServiceFailed { service, .. }
            | GraphError::InvalidTransition { service, .. }
            | GraphError::CyclicDependency { service, .. } => service,
        }
    }
}

fn format_path(path: &[ServiceId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Result type for graph operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

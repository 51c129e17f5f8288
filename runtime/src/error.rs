//! Error types for the runtime.

use fieldsync_engine::{FeatureKey, GraphError};

use crate::config::ConfigError;

/// Authentication failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("No cached session")]
    CacheMiss,

    #[error("Cached session expired")]
    Expired,

    #[error("Auth backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("Auth request failed: {0}")]
    Network(String),

    #[error("Auth task aborted")]
    Aborted,
}

/// Broker connectivity failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Transport closed")]
    Closed,

    #[error("Malformed message on {topic}: {reason}")]
    Decode { topic: String, reason: String },
}

/// Failures while pushing a single mutation to the backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Backend rejected {key}: {status} {message}")]
    Rejected {
        key: FeatureKey,
        status: u16,
        message: String,
    },

    #[error("{key} has no remote id yet")]
    MissingRemoteId { key: FeatureKey },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed backend response: {0}")]
    Decode(String),

    #[error("Store error: {0}")]
    Store(#[from] fieldsync_engine::Error),

    #[error("Sync task aborted")]
    Aborted,
}

/// Top-level runtime error.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Store error: {0}")]
    Store(#[from] fieldsync_engine::Error),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    #[error("{0}")]
    Service(String),
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

//! # fieldsync engine
//!
//! The deterministic core of the fieldsync mobile sync runtime.
//!
//! This crate holds everything that can be expressed without IO: the feature
//! stores a device edits while offline, the per-store audit queues of mutations
//! awaiting remote acknowledgment, the bounded buffer used while a broker
//! connection is down, the message envelope, and the dependency graph that
//! decides in which order services start.
//!
//! ## Design Principles
//!
//! - **No IO**: no files, sockets, clocks or async runtime
//! - **Deterministic**: timestamps are passed in by the caller
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Feature stores
//!
//! A [`FeatureStore`] is a set of layers, each holding [`FeatureRow`]s keyed by a
//! local row id. Every local mutation is recorded in the store's [`AuditQueue`]
//! as a [`SyncItem`] until the remote system acknowledges it.
//!
//! ### Audit queues
//!
//! An [`AuditQueue`] is an ordered set keyed by [`FeatureKey`]. Items drain in
//! insertion order; mutating a feature that already has a pending entry replaces
//! that entry instead of appending a second one.
//!
//! ### Service graph
//!
//! [`DependencyGraph`] tracks [`ServiceNode`]s and their declared dependencies
//! and computes depth-first start plans, rejecting missing dependencies and
//! cycles before any service is touched.
//!
//! ## Quick Start
//!
//! ```rust
//! use fieldsync_engine::{FeatureStore, SyncOperation};
//! use serde_json::json;
//!
//! let mut store = FeatureStore::new("survey");
//! store.add_layer("trees");
//!
//! let feature = store
//!     .insert("trees", json!({"species": "oak"}), 1706745600000)
//!     .unwrap();
//! assert_eq!(store.pending_count(), 1);
//!
//! let item = store.pending().next().unwrap().clone();
//! assert_eq!(item.operation, SyncOperation::Create);
//!
//! // The backend acknowledged the create and assigned an id.
//! store.acknowledge(&item, Some("remote-42".into())).unwrap();
//! assert_eq!(store.pending_count(), 0);
//! assert_eq!(
//!     store.get("trees", feature.key.local_row_id).unwrap().remote_id.as_deref(),
//!     Some("remote-42")
//! );
//! ```
//!
//! ## Persistence
//!
//! Use [`FeatureStore::export_state`] and [`FeatureStore::import_state`] with
//! [`StoreSnapshot`] to persist rows and pending mutations across restarts.

pub mod audit;
pub mod buffer;
pub mod envelope;
pub mod error;
pub mod graph;
pub mod operation;
pub mod record;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use audit::{AuditEntry, AuditQueue, Enqueued};
pub use buffer::DropOldestBuffer;
pub use envelope::Envelope;
pub use error::{Error, GraphError, GraphResult};
pub use graph::{
    DependencyGraph, ServiceId, ServiceNode, ServiceStatus, ServiceStatusEvent, StartPlan,
};
pub use operation::{FeatureKey, FeatureRef, SyncItem, SyncOperation};
pub use record::FeatureRow;
pub use snapshot::{StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{FeatureStore, Layer, QueryBuilder};

/// Type aliases for clarity
pub type StoreId = String;
pub type LayerId = String;
pub type LocalRowId = u64;
pub type RemoteRowId = String;
pub type Timestamp = u64;

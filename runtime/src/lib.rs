//! Fieldsync runtime - service lifecycle, connectivity and offline-first
//! sync for field data collection clients.
//!
//! The pure state machines live in `fieldsync-engine`. This crate adds the
//! async plumbing around them:
//!
//! - [`graph::ServiceGraph`] starts and stops services in dependency order
//! - [`auth::AuthSession`] owns the login status and the access credential
//! - [`transport::ConnectivityTransport`] keeps a broker connection alive and
//!   buffers publishes while offline
//! - [`sync::SyncEngine`] drains pending edits to the backend whenever the
//!   device is connected and authenticated
//!
//! [`app::Runtime`] wires the standard services together.

pub mod app;
pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod services;
pub mod sync;
pub mod transport;

pub use app::{Runtime, RuntimeBuilder};
pub use config::Config;
pub use context::{Fault, FaultSink, RuntimeContext};
pub use error::{Result, RuntimeError};

//! The remote transaction seam.

use futures::future::BoxFuture;

use fieldsync_engine::{RemoteRowId, SyncItem};

use crate::error::SyncError;

/// The backend's answer to a successful send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteAck {
    /// Id assigned by the backend, for creates
    pub remote_id: Option<RemoteRowId>,
}

impl RemoteAck {
    pub fn with_remote_id(remote_id: impl Into<RemoteRowId>) -> Self {
        Self {
            remote_id: Some(remote_id.into()),
        }
    }
}

/// Applies one queued mutation on the remote system.
///
/// Delivery is at least once: a send that succeeded remotely but whose
/// acknowledgment was lost will be repeated.
pub trait RemoteSink: Send + Sync + 'static {
    fn send<'a>(&'a self, item: &'a SyncItem) -> BoxFuture<'a, Result<RemoteAck, SyncError>>;
}

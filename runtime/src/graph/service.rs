//! The lifecycle capability every service implements.

use futures::future::BoxFuture;

use fieldsync_engine::ServiceId;

use crate::error::Result;

/// A lifecycle-managed subsystem owned by a [`ServiceGraph`].
///
/// The graph decides when `start` and `stop` run; implementations only do
/// their own work. `pause` and `resume` are optional and never change the
/// node's status.
///
/// [`ServiceGraph`]: super::ServiceGraph
pub trait Service: Send + Sync + 'static {
    fn id(&self) -> ServiceId;

    /// Services that must be `Running` before this one starts.
    fn dependencies(&self) -> Vec<ServiceId> {
        Vec::new()
    }

    fn start(&self) -> BoxFuture<'_, Result<()>>;

    fn stop(&self) -> BoxFuture<'_, Result<()>>;

    fn pause(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn resume(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

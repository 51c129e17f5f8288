//! Login at startup.

use futures::future::BoxFuture;

use fieldsync_engine::graph::{SC_AUTH_SERVICE, SC_CONFIG_SERVICE};
use fieldsync_engine::ServiceId;

use crate::auth::AuthSession;
use crate::context::RuntimeContext;
use crate::error::Result;
use crate::graph::Service;

/// Restores the cached session on start, falling back to the configured
/// username and password. A failed login does not fail the service; the
/// login status reports it.
pub struct AuthService {
    ctx: RuntimeContext,
    session: AuthSession,
}

impl AuthService {
    pub fn new(ctx: RuntimeContext, session: AuthSession) -> Self {
        Self { ctx, session }
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }
}

impl Service for AuthService {
    fn id(&self) -> ServiceId {
        ServiceId::new(SC_AUTH_SERVICE)
    }

    fn dependencies(&self) -> Vec<ServiceId> {
        vec![ServiceId::new(SC_CONFIG_SERVICE)]
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.session.is_authenticated() {
                return Ok(());
            }
            if self.session.authenticate_from_cache().await.is_ok() {
                return Ok(());
            }
            match self.ctx.config().login() {
                Some((username, password)) => {
                    if let Err(err) = self.session.authenticate(username, password).await {
                        tracing::warn!(error = %err, "configured login failed");
                    }
                }
                None => tracing::info!("no cached session, waiting for login"),
            }
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

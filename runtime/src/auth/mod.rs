//! Login state and credentials.
//!
//! [`AuthSession`] is the single writer of [`LoginStatus`]. Readers hold a
//! `watch` receiver and always see the latest status, including ones that
//! subscribe late.

mod cache;
mod strategy;

pub use cache::{CachedLogin, CredentialCache, MemoryCredentialCache};
pub use strategy::{AuthStrategy, HttpAuthStrategy};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use crate::context::RuntimeContext;
use crate::error::AuthError;

/// Whether the device currently holds a usable credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoginStatus {
    NotAuthenticated,
    Authenticated,
    AuthenticationFailed,
}

impl fmt::Display for LoginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoginStatus::NotAuthenticated => "not authenticated",
            LoginStatus::Authenticated => "authenticated",
            LoginStatus::AuthenticationFailed => "authentication failed",
        };
        f.write_str(name)
    }
}

/// Bearer credential for the broker and the backend.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// A credential that never expires.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// The device's login session.
#[derive(Clone)]
pub struct AuthSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    ctx: RuntimeContext,
    strategy: Arc<dyn AuthStrategy>,
    status: watch::Sender<LoginStatus>,
    credential: RwLock<Option<Credential>>,
}

impl AuthSession {
    pub fn new(ctx: RuntimeContext, strategy: Arc<dyn AuthStrategy>) -> Self {
        let (status, _) = watch::channel(LoginStatus::NotAuthenticated);
        Self {
            inner: Arc::new(SessionInner {
                ctx,
                strategy,
                status,
                credential: RwLock::new(None),
            }),
        }
    }

    /// Log in with a username and password.
    ///
    /// On failure the session is logged out first, then the status becomes
    /// `AuthenticationFailed`.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<(), AuthError> {
        let strategy = Arc::clone(&self.inner.strategy);
        let (user, pass) = (username.to_string(), password.to_string());
        let result = self
            .inner
            .ctx
            .run_network(async move { strategy.authenticate(&user, &pass).await })
            .await
            .unwrap_or_else(|_| Err(AuthError::Aborted));

        match result {
            Ok(credential) => {
                self.accept(credential).await;
                tracing::info!(user = %username, "authenticated");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(user = %username, error = %err, "authentication failed");
                self.clear().await;
                self.inner
                    .status
                    .send_replace(LoginStatus::AuthenticationFailed);
                Err(err)
            }
        }
    }

    /// Restore the cached session. A miss leaves the session
    /// `NotAuthenticated`.
    pub async fn authenticate_from_cache(&self) -> Result<(), AuthError> {
        let strategy = Arc::clone(&self.inner.strategy);
        let result = self
            .inner
            .ctx
            .run_network(async move { strategy.authenticate_from_cache().await })
            .await
            .unwrap_or_else(|_| Err(AuthError::Aborted));

        match result {
            Ok(credential) => {
                self.accept(credential).await;
                tracing::info!("session restored from cache");
                Ok(())
            }
            Err(err) => {
                tracing::debug!(error = %err, "no cached session");
                *self.inner.credential.write().await = None;
                self.inner.status.send_replace(LoginStatus::NotAuthenticated);
                Err(err)
            }
        }
    }

    pub async fn logout(&self) {
        self.clear().await;
        self.inner.status.send_replace(LoginStatus::NotAuthenticated);
        tracing::info!("logged out");
    }

    /// Subscribe to login status. The receiver starts at the current value.
    pub fn status(&self) -> watch::Receiver<LoginStatus> {
        self.inner.status.subscribe()
    }

    pub fn current_status(&self) -> LoginStatus {
        *self.inner.status.borrow()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current_status() == LoginStatus::Authenticated
    }

    /// The credential as of now. Callers read it per use, never cache it.
    pub async fn credential(&self) -> Option<Credential> {
        self.inner.credential.read().await.clone()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.inner
            .credential
            .read()
            .await
            .as_ref()
            .map(|c| c.access_token.clone())
    }

    async fn accept(&self, credential: Credential) {
        *self.inner.credential.write().await = Some(credential);
        self.inner.status.send_replace(LoginStatus::Authenticated);
    }

    async fn clear(&self) {
        self.inner.strategy.logout().await;
        *self.inner.credential.write().await = None;
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("status", &self.current_status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use futures::future::BoxFuture;

    struct FixedStrategy {
        cache: MemoryCredentialCache,
    }

    impl AuthStrategy for FixedStrategy {
        fn authenticate<'a>(
            &'a self,
            username: &'a str,
            password: &'a str,
        ) -> BoxFuture<'a, Result<Credential, AuthError>> {
            Box::pin(async move {
                if password != "pw" {
                    return Err(AuthError::InvalidCredentials);
                }
                let credential = Credential::new(format!("token-{username}"));
                self.cache.store(CachedLogin {
                    username: username.to_string(),
                    credential: credential.clone(),
                });
                Ok(credential)
            })
        }

        fn authenticate_from_cache(&self) -> BoxFuture<'_, Result<Credential, AuthError>> {
            Box::pin(async move {
                self.cache
                    .load()
                    .map(|login| login.credential)
                    .ok_or(AuthError::CacheMiss)
            })
        }

        fn logout(&self) -> BoxFuture<'_, ()> {
            Box::pin(async move { self.cache.clear() })
        }
    }

    fn session() -> AuthSession {
        let ctx = RuntimeContext::for_current(Config::default()).unwrap();
        AuthSession::new(
            ctx,
            Arc::new(FixedStrategy {
                cache: MemoryCredentialCache::new(),
            }),
        )
    }

    #[tokio::test]
    async fn login_then_logout() {
        let session = session();
        let status = session.status();
        assert_eq!(*status.borrow(), LoginStatus::NotAuthenticated);

        session.authenticate("ana", "pw").await.unwrap();
        assert_eq!(*status.borrow(), LoginStatus::Authenticated);
        assert_eq!(session.access_token().await.as_deref(), Some("token-ana"));

        session.logout().await;
        assert_eq!(*status.borrow(), LoginStatus::NotAuthenticated);
        assert!(session.credential().await.is_none());
    }

    #[tokio::test]
    async fn failed_login_clears_previous_session() {
        let session = session();
        session.authenticate("ana", "pw").await.unwrap();

        let err = session.authenticate("ana", "wrong").await.unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);
        assert_eq!(session.current_status(), LoginStatus::AuthenticationFailed);
        assert!(session.credential().await.is_none());

        // The cached login went with it
        assert_eq!(
            session.authenticate_from_cache().await,
            Err(AuthError::CacheMiss)
        );
        assert_eq!(session.current_status(), LoginStatus::NotAuthenticated);
    }

    #[tokio::test]
    async fn cache_restores_session() {
        let session = session();
        session.authenticate("ana", "pw").await.unwrap();

        let restored = AuthSession::new(
            RuntimeContext::for_current(Config::default()).unwrap(),
            Arc::clone(&session.inner.strategy),
        );
        let late = restored.status();
        restored.authenticate_from_cache().await.unwrap();
        assert_eq!(*late.borrow(), LoginStatus::Authenticated);
    }

    #[test]
    fn expiry() {
        let now = Utc::now();
        let mut credential = Credential::new("secret-token");
        assert!(!credential.is_expired(now));
        credential.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(credential.is_expired(now));
        assert!(!format!("{credential:?}").contains("secret-token"));
    }
}

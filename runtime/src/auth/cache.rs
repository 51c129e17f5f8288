//! Credential persistence seam.

use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use super::Credential;

/// A credential remembered between sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedLogin {
    pub username: String,
    pub credential: Credential,
}

/// Secure credential storage provided by the host platform.
pub trait CredentialCache: Send + Sync + 'static {
    fn load(&self) -> Option<CachedLogin>;
    fn store(&self, login: CachedLogin);
    fn clear(&self);
}

/// Process-local cache. Forgets everything on exit.
#[derive(Debug, Default)]
pub struct MemoryCredentialCache {
    slot: RwLock<Option<CachedLogin>>,
}

impl MemoryCredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache that already holds `login`.
    pub fn with_login(login: CachedLogin) -> Self {
        Self {
            slot: RwLock::new(Some(login)),
        }
    }
}

impl CredentialCache for MemoryCredentialCache {
    fn load(&self) -> Option<CachedLogin> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, login: CachedLogin) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(login);
    }

    fn clear(&self) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

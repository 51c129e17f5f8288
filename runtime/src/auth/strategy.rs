//! Authentication strategies.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::cache::{CachedLogin, CredentialCache};
use super::Credential;
use crate::error::AuthError;

/// How credentials are obtained and discarded.
pub trait AuthStrategy: Send + Sync + 'static {
    fn authenticate<'a>(
        &'a self,
        username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, Result<Credential, AuthError>>;

    /// Restore a previous session without user input.
    fn authenticate_from_cache(&self) -> BoxFuture<'_, Result<Credential, AuthError>>;

    fn logout(&self) -> BoxFuture<'_, ()>;
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
    /// Lifetime in seconds
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Password login against `POST {base}/auth/token`.
pub struct HttpAuthStrategy {
    client: reqwest::Client,
    token_url: String,
    cache: Arc<dyn CredentialCache>,
}

impl HttpAuthStrategy {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        cache: Arc<dyn CredentialCache>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url, cache))
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        cache: Arc<dyn CredentialCache>,
    ) -> Self {
        Self {
            client,
            token_url: format!("{}/auth/token", base_url.trim_end_matches('/')),
            cache,
        }
    }

    async fn request_token(&self, username: &str, password: &str) -> Result<Credential, AuthError> {
        let response = self
            .client
            .post(&self.token_url)
            .json(&TokenRequest { username, password })
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AuthError::InvalidCredentials);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AuthError::Backend {
                status: status.as_u16(),
                message,
            });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let expires_at = body
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        Ok(Credential {
            access_token: body.access_token,
            expires_at,
        })
    }
}

impl AuthStrategy for HttpAuthStrategy {
    fn authenticate<'a>(
        &'a self,
        username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, Result<Credential, AuthError>> {
        Box::pin(async move {
            let credential = self.request_token(username, password).await?;
            self.cache.store(CachedLogin {
                username: username.to_string(),
                credential: credential.clone(),
            });
            Ok(credential)
        })
    }

    fn authenticate_from_cache(&self) -> BoxFuture<'_, Result<Credential, AuthError>> {
        Box::pin(async move {
            let login = self.cache.load().ok_or(AuthError::CacheMiss)?;
            if login.credential.is_expired(Utc::now()) {
                self.cache.clear();
                return Err(AuthError::Expired);
            }
            Ok(login.credential)
        })
    }

    fn logout(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.cache.clear() })
    }
}

//! REST adapter for the feature backend.
//!
//! | operation | request |
//! |-----------|---------|
//! | create | `POST {base}/stores/{store}/layers/{layer}/features` |
//! | update | `PUT {base}/stores/{store}/layers/{layer}/features/{remote_id}` |
//! | delete | `DELETE {base}/stores/{store}/layers/{layer}/features/{remote_id}` |
//!
//! Every request carries the session's current bearer token.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use fieldsync_engine::{FeatureKey, LocalRowId, SyncItem, SyncOperation};

use super::remote::{RemoteAck, RemoteSink};
use crate::auth::AuthSession;
use crate::error::SyncError;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody<'a> {
    local_id: LocalRowId,
    properties: &'a serde_json::Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateBody<'a> {
    properties: &'a serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    remote_id: String,
}

/// [`RemoteSink`] over HTTP.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    auth: AuthSession,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration, auth: AuthSession) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url, auth))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, auth: AuthSession) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn collection_url(&self, key: &FeatureKey) -> String {
        format!(
            "{}/stores/{}/layers/{}/features",
            self.base_url, key.store_id, key.layer_id
        )
    }

    fn feature_url(&self, item: &SyncItem) -> Result<String, SyncError> {
        let remote_id = item
            .remote_row_id()
            .ok_or_else(|| SyncError::MissingRemoteId {
                key: item.key().clone(),
            })?;
        Ok(format!("{}/{}", self.collection_url(item.key()), remote_id))
    }

    async fn transmit(&self, item: &SyncItem) -> Result<RemoteAck, SyncError> {
        let token = self
            .auth
            .access_token()
            .await
            .ok_or(SyncError::NotAuthenticated)?;

        let request = match item.operation {
            SyncOperation::Create => self.client.post(self.collection_url(item.key())).json(
                &CreateBody {
                    local_id: item.key().local_row_id,
                    properties: &item.properties,
                },
            ),
            SyncOperation::Update => self.client.put(self.feature_url(item)?).json(&UpdateBody {
                properties: &item.properties,
            }),
            SyncOperation::Delete => self.client.delete(self.feature_url(item)?),
        };

        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;

        let status = response.status();
        if item.operation == SyncOperation::Delete && status == StatusCode::NOT_FOUND {
            // Already gone remotely; a repeated delete is still a success.
            return Ok(RemoteAck::default());
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(SyncError::NotAuthenticated);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SyncError::Rejected {
                key: item.key().clone(),
                status: status.as_u16(),
                message,
            });
        }

        match item.operation {
            SyncOperation::Create => {
                let body: CreateResponse = response
                    .json()
                    .await
                    .map_err(|e| SyncError::Decode(e.to_string()))?;
                Ok(RemoteAck::with_remote_id(body.remote_id))
            }
            SyncOperation::Update | SyncOperation::Delete => Ok(RemoteAck::default()),
        }
    }
}

impl RemoteSink for HttpBackend {
    fn send<'a>(&'a self, item: &'a SyncItem) -> BoxFuture<'a, Result<RemoteAck, SyncError>> {
        Box::pin(self.transmit(item))
    }
}

//! ============================================================================
//! Data Backend - Where resolver fetches actually go
//! ============================================================================
//! `HttpBackend` issues `GET {base}{source}?{params}` with the bearer token
//! from the auth collaborator. A missing token fails as `Unauthorized`
//! before anything touches the network.
//! ============================================================================

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::{DataRequest, FetchError};
use crate::auth::TokenProvider;

/// Source of widget data
#[async_trait]
pub trait DataBackend: Send + Sync {
    async fn fetch(&self, request: &DataRequest) -> Result<Value, FetchError>;
}

/// Backend data endpoints over HTTP
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("capture-core/1.0")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.into(),
            tokens,
        }
    }
}

#[async_trait]
impl DataBackend for HttpBackend {
    async fn fetch(&self, request: &DataRequest) -> Result<Value, FetchError> {
        let token = self.tokens.bearer_token().await.ok_or(FetchError::Unauthorized)?;
        let url = join_url(&self.base_url, &request.source);

        debug!("GET {}", request);

        let response = self
            .client
            .get(&url)
            .query(&request.params)
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(FetchError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

/// Join a base URL and an absolute or relative path with exactly one slash
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn transport_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout { after_ms: 0 }
    } else {
        FetchError::Transport(e.to_string())
    }
}

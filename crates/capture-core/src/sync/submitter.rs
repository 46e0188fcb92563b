//! ============================================================================
//! Submitter - Delivers one queued session to the submission endpoint
//! ============================================================================
//! `HttpSubmitter` uploads each locally held attachment blob with
//! `PUT {base}/attachments/{blobId}` and then posts the session to
//! `POST {base}/sessions`. Blob ids are content hashes, so re-uploading is
//! harmless.
//!
//! Response classification:
//! | Status              | Outcome                                      |
//! |---------------------|----------------------------------------------|
//! | 2xx                 | Accepted (Duplicate if body says duplicate)  |
//! | 409                 | Duplicate                                    |
//! | 400, 422            | Rejected with the server's reason            |
//! | 401, 403            | Unauthorized (error)                         |
//! | anything else       | ServerError (transient)                      |
//! ============================================================================

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::auth::TokenProvider;
use crate::resolver::join_url;
use crate::session::{AttachmentRef, SubmittedSession};

/// How the server answered a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum SubmitOutcome {
    Accepted,
    /// Server already holds this session id
    Duplicate,
    /// Business-rule rejection; never retried automatically
    Rejected { reason: String },
    /// Server-side trouble; retried with backoff
    ServerError { status: u16, message: String },
}

/// The submission never got a verdict
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("No bearer token available")]
    Unauthorized,

    #[error("Submission timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(
        &self,
        session: &SubmittedSession,
        blobs: &[(AttachmentRef, Vec<u8>)],
    ) -> Result<SubmitOutcome, SubmitError>;
}

/// Submission endpoint over HTTP
pub struct HttpSubmitter {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpSubmitter {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("capture-core/1.0")
            .timeout(timeout)
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
impl Submitter for HttpSubmitter {
    async fn submit(
        &self,
        session: &SubmittedSession,
        blobs: &[(AttachmentRef, Vec<u8>)],
    ) -> Result<SubmitOutcome, SubmitError> {
        let token = self.tokens.bearer_token().await.ok_or(SubmitError::Unauthorized)?;

        for (reference, bytes) in blobs {
            let url = join_url(&self.base_url, &format!("attachments/{}", reference.blob_id));
            debug!("PUT {} ({} bytes)", url, reference.size);

            let response = self
                .client
                .put(&url)
                .bearer_auth(&token)
                .header(reqwest::header::CONTENT_TYPE, reference.media_type.as_str())
                .body(bytes.clone())
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            match classify_response(status, &body)? {
                SubmitOutcome::Accepted | SubmitOutcome::Duplicate => {}
                other => return Ok(other),
            }
        }

        let url = join_url(&self.base_url, "sessions");
        debug!("POST {} session {}", url, session.session_id());

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(session)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        classify_response(status, &body)
    }
}

fn transport_error(e: reqwest::Error) -> SubmitError {
    if e.is_timeout() {
        SubmitError::Timeout { after_ms: 0 }
    } else {
        SubmitError::Transport(e.to_string())
    }
}

/// Map a submission response to an outcome
pub fn classify_response(status: u16, body: &str) -> Result<SubmitOutcome, SubmitError> {
    let json: Option<Value> = serde_json::from_str(body).ok();

    match status {
        200..=299 => {
            let duplicate = json.as_ref().is_some_and(|v| {
                v.get("status").and_then(Value::as_str) == Some("duplicate")
                    || v.get("duplicate").and_then(Value::as_bool) == Some(true)
            });
            Ok(if duplicate {
                SubmitOutcome::Duplicate
            } else {
                SubmitOutcome::Accepted
            })
        }
        409 => Ok(SubmitOutcome::Duplicate),
        400 | 422 => Ok(SubmitOutcome::Rejected {
            reason: server_message(json.as_ref(), body, "rejected by server"),
        }),
        401 | 403 => Err(SubmitError::Unauthorized),
        _ => Ok(SubmitOutcome::ServerError {
            status,
            message: server_message(json.as_ref(), body, "server error"),
        }),
    }
}

fn server_message(json: Option<&Value>, body: &str, fallback: &str) -> String {
    json.and_then(|v| {
        ["reason", "message", "error"]
            .iter()
            .find_map(|key| v.get(*key).and_then(Value::as_str))
    })
    .map(str::to_string)
    .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
    .unwrap_or_else(|| fallback.to_string())
}

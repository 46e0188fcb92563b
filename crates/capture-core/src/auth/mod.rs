//! ============================================================================
//! Auth Module - Bearer token collaborator
//! ============================================================================
//! Authentication mechanics live outside the capture core. The core only asks
//! a `TokenProvider` for the current bearer token before each network call;
//! no token means the call is `Unauthorized` and is never attempted.
//! ============================================================================

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Supplies the bearer token attached as `Authorization: Bearer <token>`
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Option<String>;
}

/// Fixed token, typically from `CAPTURE_API_TOKEN`
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.is_empty()))
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Token the host app sets on sign-in and clears on sign-out
#[derive(Debug, Clone, Default)]
pub struct SharedToken {
    inner: Arc<RwLock<Option<String>>>,
}

impl SharedToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: impl Into<String>) {
        *self.inner.write().await = Some(token.into());
        debug!("Bearer token updated");
    }

    pub async fn clear(&self) {
        *self.inner.write().await = None;
        debug!("Bearer token cleared");
    }
}

#[async_trait]
impl TokenProvider for SharedToken {
    async fn bearer_token(&self) -> Option<String> {
        self.inner.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_ignores_empty() {
        assert_eq!(StaticToken::new(Some(String::new())).bearer_token().await, None);
        assert_eq!(
            StaticToken::new(Some("abc".into())).bearer_token().await.as_deref(),
            Some("abc")
        );
    }

    #[tokio::test]
    async fn test_shared_token_set_and_clear() {
        let token = SharedToken::new();
        let handle = token.clone();
        assert_eq!(token.bearer_token().await, None);

        handle.set("t-1").await;
        assert_eq!(token.bearer_token().await.as_deref(), Some("t-1"));

        handle.clear().await;
        assert_eq!(token.bearer_token().await, None);
    }
}

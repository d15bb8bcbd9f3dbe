//! OAuth access tokens for Google API calls.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::context::MetadataServer;
use crate::error::TransportError;

/// Metadata key serving the default service account's access token.
const TOKEN_KEY: &str = "instance/service-accounts/default/token";

/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Source of bearer tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, TransportError>;
}

/// A fixed token, e.g. from `CLOUDJOB_ACCESS_TOKEN`.
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String, TransportError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refresh_at: DateTime<Utc>,
}

/// Service-account token served by the instance metadata server.
pub struct MetadataServerToken {
    server: Arc<MetadataServer>,
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataServerToken {
    pub fn new(server: Arc<MetadataServer>) -> Self {
        Self {
            server,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TokenSource for MetadataServerToken {
    async fn access_token(&self) -> Result<String, TransportError> {
        let mut cached = self.cached.lock().await;
        if let Some(ref token) = *cached {
            if Utc::now() < token.refresh_at {
                return Ok(token.token.clone());
            }
        }

        let raw = self
            .server
            .fetch(TOKEN_KEY)
            .await?
            .ok_or_else(|| TransportError::Token("no default service account".to_string()))?;
        let response: TokenResponse = serde_json::from_str(&raw)
            .map_err(|e| TransportError::Token(format!("malformed token response: {e}")))?;

        let lifetime = (response.expires_in - EXPIRY_MARGIN_SECS).max(0);
        let refresh_at = Utc::now() + ChronoDuration::seconds(lifetime);
        tracing::debug!(refresh_at = %refresh_at, "Obtained access token");

        *cached = Some(CachedToken {
            token: response.access_token.clone(),
            refresh_at,
        });
        Ok(response.access_token)
    }
}

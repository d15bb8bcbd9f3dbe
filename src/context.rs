//! Instance metadata server client and the resolved execution context.
//!
//! Every worker process derives its own context from the environment and the
//! metadata server; nothing here is shared across processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::CloudConfig;
use crate::error::{ConfigError, TransportError};
use crate::http::{HttpRequest, HttpTransport};

/// Metadata key holding the JSON artifact descriptors for this run.
pub const ARTIFACTS_ATTRIBUTE: &str = "instance/attributes/artifacts";

const PROJECT_KEY: &str = "project/project-id";

/// Lazily populated cache of metadata server values.
///
/// Values never change for the lifetime of an instance, so entries are never
/// invalidated. Absent keys are not cached.
#[derive(Debug, Default)]
pub struct MetadataCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    // Inserts are single map operations; a poisoned lock still holds whole entries.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries().get(key).cloned()
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.entries().insert(key.to_string(), value.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Client for the instance metadata server.
pub struct MetadataServer {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    cache: MetadataCache,
}

impl MetadataServer {
    pub fn new(transport: Arc<dyn HttpTransport>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache: MetadataCache::new(),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }

    /// Looks up `key`, serving repeated lookups from the cache.
    ///
    /// Returns `Ok(None)` when the server reports the key as absent (404).
    pub async fn query(&self, key: &str) -> Result<Option<String>, TransportError> {
        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value));
        }
        let value = self.fetch(key).await?;
        if let Some(ref value) = value {
            self.cache.insert(key, value);
        }
        Ok(value)
    }

    /// Looks up `key` bypassing the cache. Used for short-lived values such
    /// as access tokens.
    pub async fn fetch(&self, key: &str) -> Result<Option<String>, TransportError> {
        let url = self.url(key);
        let response = self
            .transport
            .send(HttpRequest::get(&url).with_header("Metadata-Flavor", "Google"))
            .await?;

        match response.status {
            404 => {
                tracing::debug!(key, "Metadata key not present");
                Ok(None)
            }
            _ if response.is_success() => Ok(Some(response.text())),
            status => Err(TransportError::Status { url, status }),
        }
    }

    /// Looks up a key that must be present.
    pub async fn require(&self, key: &str) -> Result<String, ConfigError> {
        self.query(key)
            .await
            .map_err(|source| ConfigError::MetadataServer {
                key: key.to_string(),
                source,
            })?
            .ok_or_else(|| ConfigError::Missing(format!("metadata key '{key}'")))
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }
}

/// Where this job runs and where its output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub project: String,
    pub zone: String,
    pub instance: String,
    pub bucket: String,
}

impl ExecutionContext {
    /// Resolves the context from configuration, falling back to the metadata
    /// server for anything not configured explicitly.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the project, zone, or instance cannot be
    /// determined.
    pub async fn resolve(
        config: &CloudConfig,
        server: &MetadataServer,
    ) -> Result<Self, ConfigError> {
        let project = match &config.project {
            Some(project) => project.clone(),
            None => server
                .query(PROJECT_KEY)
                .await
                .map_err(|source| ConfigError::MetadataServer {
                    key: PROJECT_KEY.to_string(),
                    source,
                })?
                .filter(|p| !p.trim().is_empty())
                .ok_or_else(|| ConfigError::Missing("project must be specified".to_string()))?,
        };

        let zone = match &config.zone {
            Some(zone) => zone.clone(),
            None => zone_name(&server.require("instance/zone").await?),
        };

        let instance = match &config.instance {
            Some(instance) => instance.clone(),
            None => server.require("instance/name").await?,
        };

        let context = Self {
            project,
            zone,
            instance,
            bucket: config.bucket.clone(),
        };
        tracing::info!(
            project = %context.project,
            zone = %context.zone,
            instance = %context.instance,
            bucket = %context.bucket,
            "Resolved execution context"
        );
        Ok(context)
    }
}

/// The metadata server reports zones as `projects/<num>/zones/<zone>`.
fn zone_name(raw: &str) -> String {
    raw.trim().rsplit('/').next().unwrap_or_default().to_string()
}

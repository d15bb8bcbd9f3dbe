//! Instance metadata updates with optimistic concurrency control.
//!
//! The compute API versions an instance's metadata with a fingerprint. A
//! write must present the fingerprint it last read; a stale one is rejected
//! with 412 and the writer re-reads before trying again. Other processes on
//! the same instance may be writing concurrently, so writes always merge
//! into a freshly read item set instead of overwriting it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::context::ExecutionContext;
use crate::error::MetadataError;
use crate::http::{HttpRequest, HttpTransport, RetryPolicy, Sleeper, TokioSleeper};
use crate::job::JobStatus;

/// Metadata key carrying the job status.
pub const STATUS_KEY: &str = "status";

/// Metadata key carrying the JSON artifact references of a finished job.
pub const ARTIFACTS_KEY: &str = "artifacts";

/// HTTP status the compute API uses for a stale fingerprint.
const CONFLICT_STATUS: u16 = 412;

/// Attempts made before a conflicting update is abandoned.
const MAX_ATTEMPTS: u32 = 5;

/// Pause between conflicting attempts.
const CONFLICT_DELAY: Duration = Duration::from_millis(500);

/// A single metadata entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// The instance's metadata item set and its version token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub fingerprint: String,
    #[serde(default)]
    pub items: Vec<MetadataItem>,
}

impl InstanceMetadata {
    /// Value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|item| item.key == key)
            .map(|item| item.value.as_str())
    }

    /// Sets `key`, keeping its position if present and appending otherwise.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.items.iter_mut().find(|item| item.key == key) {
            Some(item) => item.value = value.to_string(),
            None => self.items.push(MetadataItem {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Copy of this item set with the job status (and artifact references,
    /// when given) applied.
    pub fn with_status(&self, status: JobStatus, artifacts: Option<&str>) -> Self {
        let mut next = self.clone();
        next.set(STATUS_KEY, status.as_str());
        if let Some(artifacts) = artifacts {
            next.set(ARTIFACTS_KEY, artifacts);
        }
        next
    }
}

#[derive(Debug, Deserialize)]
struct InstanceDescription {
    metadata: InstanceMetadata,
}

/// Result of a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataUpdate {
    /// The write was accepted on the given attempt.
    Applied { attempts: u32 },
    /// Every attempt hit a stale fingerprint; nothing was written.
    Abandoned { attempts: u32 },
}

impl MetadataUpdate {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Reads and conditionally rewrites an instance's metadata.
pub struct MetadataStore {
    transport: Arc<dyn HttpTransport>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    instance_url: String,
}

impl MetadataStore {
    /// Creates a store for the instance named by `context`.
    ///
    /// `compute_url` is the compute API base, e.g.
    /// `https://www.googleapis.com/compute/v1`. `transport` must attach
    /// credentials.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        compute_url: &str,
        context: &ExecutionContext,
    ) -> Self {
        let instance_url = format!(
            "{}/projects/{}/zones/{}/instances/{}",
            compute_url.trim_end_matches('/'),
            context.project,
            context.zone,
            context.instance
        );
        Self {
            transport,
            retry: RetryPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
            instance_url,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the sleeper used between conflicting attempts.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    /// Reads the current item set and fingerprint.
    pub async fn read(&self) -> Result<InstanceMetadata, MetadataError> {
        let request = HttpRequest::get(&self.instance_url);
        let transport = &self.transport;
        let response = self
            .retry
            .execute(|| transport.send(request.clone()))
            .await?;
        if !response.is_success() {
            return Err(MetadataError::Status {
                url: self.instance_url.clone(),
                status: response.status,
            });
        }
        let description: InstanceDescription = response
            .json()
            .map_err(|e| MetadataError::Malformed(e.to_string()))?;
        Ok(description.metadata)
    }

    /// Publishes `status` (and `artifacts`, when given).
    ///
    /// Conflicting writes are retried from a fresh read up to five times in
    /// total, half a second apart. If every attempt conflicts the update is
    /// abandoned with a warning and `MetadataUpdate::Abandoned` is returned;
    /// this is not an error.
    ///
    /// # Errors
    ///
    /// Any non-conflict failure is returned immediately.
    pub async fn update_status(
        &self,
        status: JobStatus,
        artifacts: Option<&str>,
    ) -> Result<MetadataUpdate, MetadataError> {
        let url = format!("{}/setMetadata", self.instance_url);

        for attempt in 1..=MAX_ATTEMPTS {
            let current = self.read().await?;
            let next = current.with_status(status, artifacts);
            let request = HttpRequest::post(&url).with_json(&next)?;

            let transport = &self.transport;
            let response = self
                .retry
                .execute(|| transport.send(request.clone()))
                .await?;

            if response.is_success() {
                tracing::info!(status = %status, attempt, "Published job status");
                return Ok(MetadataUpdate::Applied { attempts: attempt });
            }
            if response.status != CONFLICT_STATUS {
                return Err(MetadataError::Status {
                    url,
                    status: response.status,
                });
            }

            tracing::debug!(
                status = %status,
                attempt,
                fingerprint = %current.fingerprint,
                "Metadata fingerprint is stale"
            );
            if attempt < MAX_ATTEMPTS {
                self.sleeper.sleep(CONFLICT_DELAY).await;
            }
        }

        tracing::warn!(
            status = %status,
            attempts = MAX_ATTEMPTS,
            "Abandoning status update after repeated metadata conflicts"
        );
        Ok(MetadataUpdate::Abandoned {
            attempts: MAX_ATTEMPTS,
        })
    }
}

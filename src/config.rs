//! Runtime configuration for cloud jobs.
//!
//! Everything can be supplied through environment variables so each worker
//! process derives the same configuration independently.

use std::time::Duration;

use crate::error::ConfigError;
use crate::http::retry::DEFAULT_RETRY_COUNT;
use crate::storage::upload::DEFAULT_CHUNK_SIZE;

/// Default destination bucket for job artifacts.
pub const DEFAULT_ARTIFACT_BUCKET: &str = "scaife-indexer-us-central1";

/// Resumable uploads require chunk sizes in multiples of 256 KiB.
const CHUNK_GRANULARITY: usize = 256 * 1024;

const DEFAULT_METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1";
const DEFAULT_COMPUTE_URL: &str = "https://www.googleapis.com/compute/v1";
const DEFAULT_STORAGE_URL: &str = "https://www.googleapis.com/storage/v1";
const DEFAULT_UPLOAD_URL: &str = "https://www.googleapis.com/upload/storage/v1";

/// Configuration for a cloud job.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    // Placement
    /// Bucket receiving saved artifacts.
    pub bucket: String,
    /// Project override; otherwise resolved from the metadata server.
    pub project: Option<String>,
    /// Zone override; otherwise resolved from the metadata server.
    pub zone: Option<String>,
    /// Instance name override; otherwise resolved from the metadata server.
    pub instance: Option<String>,

    // Endpoints
    pub metadata_url: String,
    pub compute_url: String,
    pub storage_url: String,
    pub upload_url: String,

    // Transfer
    /// Bytes per resumable upload chunk.
    pub chunk_size: usize,
    /// Additional attempts per HTTP call.
    pub retry_count: u32,
    /// Cache-Control applied to uploaded objects.
    pub cache_control: Option<String>,
    /// Per-request timeout.
    pub http_timeout: Duration,

    // Credentials
    /// Static bearer token; otherwise the metadata server token is used.
    pub access_token: Option<String>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_ARTIFACT_BUCKET.to_string(),
            project: None,
            zone: None,
            instance: None,

            metadata_url: DEFAULT_METADATA_URL.to_string(),
            compute_url: DEFAULT_COMPUTE_URL.to_string(),
            storage_url: DEFAULT_STORAGE_URL.to_string(),
            upload_url: DEFAULT_UPLOAD_URL.to_string(),

            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_count: DEFAULT_RETRY_COUNT,
            cache_control: None,
            http_timeout: Duration::from_secs(300),

            access_token: None,
        }
    }
}

impl CloudConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CLOUDJOB_ARTIFACT_BUCKET`: Artifact bucket (default: scaife-indexer-us-central1)
    /// - `CLOUDJOB_PROJECT` or `GOOGLE_CLOUD_PROJECT`: Project ID
    /// - `CLOUDJOB_ZONE`: Zone name
    /// - `CLOUDJOB_INSTANCE`: Instance name
    /// - `CLOUDJOB_METADATA_URL`: Metadata server base URL
    /// - `CLOUDJOB_COMPUTE_URL`: Compute API base URL
    /// - `CLOUDJOB_STORAGE_URL`: Storage JSON API base URL
    /// - `CLOUDJOB_UPLOAD_URL`: Storage upload API base URL
    /// - `CLOUDJOB_CHUNK_SIZE`: Upload chunk size in bytes, multiple of 256 KiB (default: 524288)
    /// - `CLOUDJOB_RETRY_COUNT`: Retries per HTTP call (default: 1)
    /// - `CLOUDJOB_CACHE_CONTROL`: Cache-Control for uploaded objects
    /// - `CLOUDJOB_HTTP_TIMEOUT_SECS`: Per-request timeout in seconds (default: 300)
    /// - `CLOUDJOB_ACCESS_TOKEN`: Static bearer token
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(bucket) = get("CLOUDJOB_ARTIFACT_BUCKET") {
            config.bucket = bucket;
        }
        config.project = get("CLOUDJOB_PROJECT").or_else(|| get("GOOGLE_CLOUD_PROJECT"));
        config.zone = get("CLOUDJOB_ZONE");
        config.instance = get("CLOUDJOB_INSTANCE");

        if let Some(url) = get("CLOUDJOB_METADATA_URL") {
            config.metadata_url = url;
        }
        if let Some(url) = get("CLOUDJOB_COMPUTE_URL") {
            config.compute_url = url;
        }
        if let Some(url) = get("CLOUDJOB_STORAGE_URL") {
            config.storage_url = url;
        }
        if let Some(url) = get("CLOUDJOB_UPLOAD_URL") {
            config.upload_url = url;
        }

        if let Some(val) = get("CLOUDJOB_CHUNK_SIZE") {
            config.chunk_size = parse("CLOUDJOB_CHUNK_SIZE", &val)?;
        }
        if let Some(val) = get("CLOUDJOB_RETRY_COUNT") {
            config.retry_count = parse("CLOUDJOB_RETRY_COUNT", &val)?;
        }
        config.cache_control = get("CLOUDJOB_CACHE_CONTROL");
        if let Some(val) = get("CLOUDJOB_HTTP_TIMEOUT_SECS") {
            config.http_timeout = Duration::from_secs(parse("CLOUDJOB_HTTP_TIMEOUT_SECS", &val)?);
        }

        config.access_token = get("CLOUDJOB_ACCESS_TOKEN");

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket.trim().is_empty() || self.bucket.contains('/') {
            return Err(ConfigError::InvalidValue {
                key: "bucket".to_string(),
                message: format!("'{}' is not a bucket name", self.bucket),
            });
        }
        if self.chunk_size == 0 || self.chunk_size % CHUNK_GRANULARITY != 0 {
            return Err(ConfigError::InvalidValue {
                key: "chunk_size".to_string(),
                message: format!(
                    "{} must be a positive multiple of {}",
                    self.chunk_size, CHUNK_GRANULARITY
                ),
            });
        }
        if self.http_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "http_timeout".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = CloudConfig::default();
        assert_eq!(config.bucket, DEFAULT_ARTIFACT_BUCKET);
        assert_eq!(config.chunk_size, 512 * 1024);
        assert_eq!(config.retry_count, 1);
        assert!(config.project.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = CloudConfig::from_lookup(lookup(&[
            ("CLOUDJOB_ARTIFACT_BUCKET", "my-bucket"),
            ("GOOGLE_CLOUD_PROJECT", "fallback-project"),
            ("CLOUDJOB_ZONE", "us-east1-b"),
            ("CLOUDJOB_CHUNK_SIZE", "1048576"),
            ("CLOUDJOB_RETRY_COUNT", "3"),
            ("CLOUDJOB_CACHE_CONTROL", "no-cache"),
            ("CLOUDJOB_UPLOAD_URL", "http://localhost:4443/upload/storage/v1"),
        ]))
        .expect("config should parse");

        assert_eq!(config.bucket, "my-bucket");
        assert_eq!(config.project.as_deref(), Some("fallback-project"));
        assert_eq!(config.zone.as_deref(), Some("us-east1-b"));
        assert_eq!(config.instance, None);
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.cache_control.as_deref(), Some("no-cache"));
        assert_eq!(config.upload_url, "http://localhost:4443/upload/storage/v1");
    }

    #[test]
    fn test_explicit_project_wins() {
        let config = CloudConfig::from_lookup(lookup(&[
            ("CLOUDJOB_PROJECT", "explicit"),
            ("GOOGLE_CLOUD_PROJECT", "fallback"),
        ]))
        .unwrap();
        assert_eq!(config.project.as_deref(), Some("explicit"));
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let err = CloudConfig::from_lookup(lookup(&[("CLOUDJOB_RETRY_COUNT", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "CLOUDJOB_RETRY_COUNT"));
    }

    #[test]
    fn test_chunk_size_granularity() {
        let err = CloudConfig::from_lookup(lookup(&[("CLOUDJOB_CHUNK_SIZE", "1000")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "chunk_size"));
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let config = CloudConfig::from_lookup(lookup(&[("CLOUDJOB_ARTIFACT_BUCKET", "  ")])).unwrap();
        assert_eq!(config.bucket, DEFAULT_ARTIFACT_BUCKET);
    }
}

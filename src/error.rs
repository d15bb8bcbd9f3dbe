//! Error types for cloudjob operations.
//!
//! Defines error types for each subsystem:
//! - Configuration and execution-context resolution
//! - HTTP transport
//! - Resumable uploads to object storage
//! - Artifact loading and saving
//! - Instance metadata updates
//! - The job lifecycle itself

use thiserror::Error;

/// Errors raised while resolving configuration or the execution context.
///
/// These are fatal: a job that cannot resolve its context never reports
/// "started".
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration value: {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Metadata server lookup for '{key}' failed: {source}")]
    MetadataServer {
        key: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Errors raised by an HTTP transport before a response is available.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Failed to read response body from {url}: {message}")]
    Body { url: String, message: String },

    #[error("Unexpected HTTP status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Failed to obtain access token: {0}")]
    Token(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during a resumable upload.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Upload session initiation for '{object}' failed with HTTP {status}")]
    Initiation { object: String, status: u16 },

    #[error("Upload session initiation for '{object}' returned no Location header")]
    MissingSessionUri { object: String },

    #[error("Chunk transfer for '{object}' failed with HTTP {status} at byte {offset}")]
    Protocol {
        object: String,
        status: u16,
        offset: u64,
    },

    #[error("Malformed Range header in upload response: {0}")]
    MalformedRange(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while loading or saving artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Unsupported artifact reference for '{key}': {reference}")]
    UnsupportedReference { key: String, reference: String },

    #[error("Invalid object storage URL: {0}")]
    InvalidStorageUrl(String),

    #[error("Download of {url} failed with HTTP {status}")]
    Download { url: String, status: u16 },

    #[error("Upload of artifact '{key}' failed: {source}")]
    Upload {
        key: String,
        #[source]
        source: UploadError,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while updating instance metadata.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Instance metadata request to {url} failed with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Malformed instance description: {0}")]
    Malformed(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that escape the job lifecycle.
///
/// Failures inside the work itself never surface here; they are reported as
/// status "failed" instead. Only failures of the reporting path propagate.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to report job status: {0}")]
    Metadata(#[from] MetadataError),
}

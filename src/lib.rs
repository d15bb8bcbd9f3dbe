//! cloudjob: job lifecycle for batch work on cloud compute instances.
//!
//! A job publishes its status to the instance metadata, materializes its
//! input artifacts, runs a unit of [`job::Work`], uploads the outputs to
//! object storage with resumable uploads, and publishes references to them.

pub mod artifacts;
pub mod auth;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod job;
pub mod metadata;
pub mod storage;

pub use artifacts::{Artifact, ArtifactManager, ArtifactMap, StorageUrl};
pub use config::CloudConfig;
pub use context::{ExecutionContext, MetadataServer};
pub use error::{ArtifactError, ConfigError, JobError, MetadataError, TransportError, UploadError};
pub use http::{HttpTransport, RetryPolicy};
pub use job::{CloudJob, Job, JobOutcome, JobStatus, Work};
pub use metadata::{MetadataStore, MetadataUpdate};
pub use storage::{ByteStream, ResumableUpload, StreamSlice};

//! Job lifecycle orchestration.
//!
//! A [`CloudJob`] wraps one unit of [`Work`] with status reporting:
//!
//! ```text
//! created ──► started ──► done    (artifacts saved and published)
//!                    └──► failed  (any error while loading, working, or saving)
//! ```
//!
//! Errors raised by the work never escape [`CloudJob::run`]; they are
//! turned into status "failed" so operators watching the instance metadata
//! always see a terminal state.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;
use uuid::Uuid;

use crate::artifacts::{encode_artifacts, Artifact, ArtifactManager, ArtifactMap};
use crate::auth::{MetadataServerToken, StaticToken, TokenSource};
use crate::config::CloudConfig;
use crate::context::{ExecutionContext, MetadataServer};
use crate::error::JobError;
use crate::http::{AuthorizedTransport, HttpTransport, ReqwestTransport, RetryPolicy};
use crate::metadata::MetadataStore;
use crate::storage::ByteStream;

/// Status published under the `status` metadata key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Started,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Started => "started",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether no further transitions follow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one run, handed to the work.
#[derive(Debug)]
pub struct Job {
    id: String,
    started_at: DateTime<Utc>,
    status: Option<JobStatus>,
    /// Inputs after loading; the work adds its outputs here.
    pub artifacts: ArtifactMap,
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

impl Job {
    /// Creates a job with a fresh unique id and no artifacts.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            status: None,
            artifacts: ArtifactMap::new(),
        }
    }

    /// Unique id of this run; also the object name prefix of its outputs.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Last status successfully handed to the metadata store, `None` while
    /// the job is still in the created state.
    pub fn status(&self) -> Option<JobStatus> {
        self.status
    }

    /// Stages an in-memory output for upload under `key`.
    pub fn add_output(&mut self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.artifacts.insert(key.into(), Artifact::output(bytes));
    }

    /// Stages a streamed output (e.g. a file) for upload under `key`.
    pub fn add_output_stream(&mut self, key: impl Into<String>, data: ByteStream) {
        self.artifacts
            .insert(key.into(), Artifact::output_stream(data));
    }

    /// Reads the full content of a pending artifact.
    pub fn read_artifact(&mut self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match self.artifacts.get_mut(key).and_then(Artifact::data_mut) {
            Some(data) => data.read_all().map(Some),
            None => Ok(None),
        }
    }
}

/// A unit of work run inside a job.
///
/// Implementations may read `job.artifacts` and stage new outputs; any
/// error marks the job failed.
#[async_trait]
pub trait Work: Send {
    async fn run(&mut self, job: &mut Job) -> anyhow::Result<()>;
}

/// Terminal result of [`CloudJob::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Work succeeded; `artifacts` is the JSON published in metadata.
    Done { artifacts: String },
    /// Work or artifact handling failed; `error` describes why.
    Failed { error: String },
}

impl JobOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, JobOutcome::Done { .. })
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Done { .. } => JobStatus::Done,
            JobOutcome::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// Job lifecycle wrapper: reports status, loads inputs, runs the work, saves
/// outputs.
pub struct CloudJob {
    job: Job,
    metadata: MetadataStore,
    artifacts: ArtifactManager,
}

impl CloudJob {
    /// Creates a job from already-built collaborators.
    pub fn new(metadata: MetadataStore, artifacts: ArtifactManager) -> Self {
        Self {
            job: Job::new(),
            metadata,
            artifacts,
        }
    }

    /// Wires up transports, credentials, and the execution context.
    ///
    /// # Errors
    ///
    /// Returns `JobError::Config` if the project, zone, or instance cannot be
    /// resolved. No status has been reported at that point.
    pub async fn from_config(config: &CloudConfig) -> Result<Self, JobError> {
        config.validate()?;
        let plain: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(config.http_timeout)?);
        let server = Arc::new(MetadataServer::new(plain.clone(), config.metadata_url.clone()));
        let context = ExecutionContext::resolve(config, &server).await?;

        let tokens: Arc<dyn TokenSource> = match &config.access_token {
            Some(token) => Arc::new(StaticToken::new(token.clone())),
            None => Arc::new(MetadataServerToken::new(server.clone())),
        };
        let authorized: Arc<dyn HttpTransport> =
            Arc::new(AuthorizedTransport::new(plain.clone(), tokens));

        let metadata = MetadataStore::new(authorized.clone(), &config.compute_url, &context)
            .with_retry_policy(RetryPolicy::new(config.retry_count));
        let artifacts = ArtifactManager::new(plain, authorized, server, config);
        Ok(Self::new(metadata, artifacts))
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn id(&self) -> &str {
        self.job.id()
    }

    /// Runs `work` through the full lifecycle.
    ///
    /// # Errors
    ///
    /// Only failures to publish "started" or "failed" are returned. Failures
    /// of the work itself, of loading and saving artifacts, or of publishing
    /// "done" are reported as status "failed" and returned as
    /// `JobOutcome::Failed`.
    pub async fn run<W: Work + ?Sized>(&mut self, work: &mut W) -> Result<JobOutcome, JobError> {
        self.report(JobStatus::Started, None).await?;
        tracing::info!(job_id = %self.job.id, "Job started");

        let err = match self.execute(work).await {
            Ok(artifacts) => match self.report(JobStatus::Done, Some(&artifacts)).await {
                Ok(()) => {
                    tracing::info!(
                        job_id = %self.job.id,
                        outputs = self.job.artifacts.len(),
                        "Job done"
                    );
                    return Ok(JobOutcome::Done { artifacts });
                }
                Err(err) => anyhow::Error::new(err).context("failed to report job done"),
            },
            Err(err) => err,
        };

        let error = format!("{err:#}");
        tracing::error!(job_id = %self.job.id, error = %error, "Job failed");
        self.report(JobStatus::Failed, None).await?;
        Ok(JobOutcome::Failed { error })
    }

    async fn execute<W: Work + ?Sized>(&mut self, work: &mut W) -> anyhow::Result<String> {
        self.artifacts
            .load_artifacts(&mut self.job)
            .await
            .context("failed to load artifacts")?;
        work.run(&mut self.job).await?;
        self.artifacts
            .save_artifacts(&mut self.job)
            .await
            .context("failed to save artifacts")?;
        Ok(encode_artifacts(&self.job.artifacts)?)
    }

    async fn report(&mut self, status: JobStatus, artifacts: Option<&str>) -> Result<(), JobError> {
        let update = self.metadata.update_status(status, artifacts).await?;
        if update.is_applied() {
            self.job.status = Some(status);
        }
        Ok(())
    }
}

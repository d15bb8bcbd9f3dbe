//! Work that runs an external program against a working directory.

use anyhow::Context;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use crate::job::{Job, Work};
use crate::storage::ByteStream;

/// Runs a program with the job's inputs on disk and collects its outputs.
#[derive(Debug, Clone)]
pub struct CommandWork {
    program: String,
    args: Vec<String>,
    workdir: PathBuf,
    output_key_prefix: Option<String>,
}

impl CommandWork {
    pub fn new(program: impl Into<String>, workdir: impl AsRef<Path>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: workdir.as_ref().to_path_buf(),
            output_key_prefix: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_output_key_prefix(mut self, prefix: Option<String>) -> Self {
        self.output_key_prefix = prefix;
        self
    }

    /// Private directory of one job: `<workdir>/<job id>`.
    pub fn job_dir(&self, job: &Job) -> PathBuf {
        self.workdir.join(job.id())
    }

    pub fn input_dir(&self, job: &Job) -> PathBuf {
        self.job_dir(job).join("inputs")
    }

    pub fn output_dir(&self, job: &Job) -> PathBuf {
        self.job_dir(job).join("outputs")
    }

    /// Creates empty `inputs/` and `outputs/` directories for `job`.
    async fn prepare_dirs(&self, job: &Job) -> anyhow::Result<()> {
        let job_dir = self.job_dir(job);
        if tokio::fs::try_exists(&job_dir).await? {
            tokio::fs::remove_dir_all(&job_dir)
                .await
                .with_context(|| format!("failed to clear {}", job_dir.display()))?;
        }
        for dir in [self.input_dir(job), self.output_dir(job)] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    async fn write_inputs(&self, job: &mut Job) -> anyhow::Result<()> {
        let dir = self.input_dir(job);
        for (key, artifact) in job.artifacts.iter_mut() {
            let Some(data) = artifact.data_mut() else {
                continue;
            };
            let path = dir.join(file_name_for_key(key)?);
            let bytes = data.read_all()?;
            tokio::fs::write(&path, &bytes)
                .await
                .with_context(|| format!("failed to write input {}", path.display()))?;
            debug!(key = %key, path = %path.display(), "Wrote input artifact");
        }
        Ok(())
    }

    async fn collect_outputs(&self, job: &mut Job) -> anyhow::Result<usize> {
        let dir = self.output_dir(job);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to list {}", dir.display()))?;

        let mut collected = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let key = match &self.output_key_prefix {
                Some(prefix) => format!("{prefix}{name}"),
                None => name,
            };
            let data = ByteStream::open(entry.path())
                .with_context(|| format!("failed to open output {}", entry.path().display()))?;
            debug!(key = %key, bytes = data.size(), "Staged output artifact");
            job.add_output_stream(key, data);
            collected += 1;
        }
        Ok(collected)
    }
}

#[async_trait]
impl Work for CommandWork {
    async fn run(&mut self, job: &mut Job) -> anyhow::Result<()> {
        self.prepare_dirs(job).await?;
        self.write_inputs(job).await?;

        info!(program = %self.program, args = ?self.args, "Starting program");
        let status = Command::new(&self.program)
            .args(&self.args)
            .env("CLOUDJOB_ID", job.id())
            .env("CLOUDJOB_INPUT_DIR", self.input_dir(job))
            .env("CLOUDJOB_OUTPUT_DIR", self.output_dir(job))
            .status()
            .await
            .with_context(|| format!("failed to start {}", self.program))?;
        if !status.success() {
            anyhow::bail!("{} exited with {}", self.program, status);
        }

        let outputs = self.collect_outputs(job).await?;
        info!(outputs, "Program finished");
        Ok(())
    }
}

/// Maps an artifact key to a flat file name.
///
/// Keys are percent-encoded, so distinct keys never share a file.
fn file_name_for_key(key: &str) -> anyhow::Result<String> {
    if matches!(key, "" | "." | "..") {
        anyhow::bail!("artifact key '{key}' cannot be used as a file name");
    }
    Ok(urlencoding::encode(key).into_owned())
}

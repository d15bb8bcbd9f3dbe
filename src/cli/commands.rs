//! CLI command definitions for cloudjob.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::work::CommandWork;
use crate::config::CloudConfig;
use crate::context::MetadataServer;
use crate::http::ReqwestTransport;
use crate::job::{CloudJob, JobOutcome};

/// Default working directory for `cloudjob run`.
const DEFAULT_WORKDIR: &str = "./cloudjob-work";

/// Runs batch programs on a compute instance with status reporting and
/// artifact persistence.
#[derive(Parser)]
#[command(name = "cloudjob")]
#[command(about = "Run a program as a cloud job with status reporting and artifact storage")]
#[command(version)]
#[command(
    long_about = "cloudjob wraps a program in a job lifecycle: it publishes status to the instance metadata,\nmaterializes input artifacts, runs the program, and uploads its outputs to object storage.\n\nExample usage:\n  cloudjob run --workdir /tmp/job -- ./tokenize.sh"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a program as a cloud job.
    ///
    /// Inputs are written to `<workdir>/<job id>/inputs/`; every regular
    /// file the program leaves in `<workdir>/<job id>/outputs/` is saved as
    /// an artifact.
    Run(RunArgs),

    /// Print a value from the instance metadata server.
    Metadata(MetadataArgs),
}

/// Arguments for `cloudjob run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Parent of the per-job directories holding `inputs/` and `outputs/`.
    #[arg(short = 'w', long, default_value = DEFAULT_WORKDIR)]
    pub workdir: PathBuf,

    /// Prefix prepended to the artifact key of every output file.
    #[arg(long)]
    pub output_key_prefix: Option<String>,

    /// Program to run, followed by its arguments.
    #[arg(required = true, last = true)]
    pub command: Vec<String>,
}

/// Arguments for `cloudjob metadata`.
#[derive(Parser, Debug)]
pub struct MetadataArgs {
    /// Metadata key relative to the server root, e.g. `instance/zone`.
    pub key: String,
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<ExitCode> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// Returns a failing exit code when the job finished with status "failed".
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Run(args) => run_job_command(args).await,
        Commands::Metadata(args) => {
            run_metadata_command(args).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_job_command(args: RunArgs) -> anyhow::Result<ExitCode> {
    let started = Instant::now();
    let config = CloudConfig::from_env().context("invalid cloudjob configuration")?;

    let (program, program_args) = args
        .command
        .split_first()
        .context("no program given after '--'")?;
    let mut work = CommandWork::new(program, &args.workdir)
        .with_args(program_args.iter().cloned())
        .with_output_key_prefix(args.output_key_prefix);

    let mut job = CloudJob::from_config(&config)
        .await
        .context("failed to set up cloud job")?;
    info!(job_id = %job.id(), program = %program, "Running job");

    let outcome = job.run(&mut work).await?;
    println!("Finished in {:.1}s", started.elapsed().as_secs_f64());

    match outcome {
        JobOutcome::Done { artifacts } => {
            println!("{artifacts}");
            Ok(ExitCode::SUCCESS)
        }
        JobOutcome::Failed { error } => {
            eprintln!("Job failed: {error}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_metadata_command(args: MetadataArgs) -> anyhow::Result<()> {
    let config = CloudConfig::from_env().context("invalid cloudjob configuration")?;
    let transport = Arc::new(ReqwestTransport::new(config.http_timeout)?);
    let server = MetadataServer::new(transport, config.metadata_url);

    match server.query(&args.key).await? {
        Some(value) => {
            println!("{value}");
            Ok(())
        }
        None => anyhow::bail!("metadata key '{}' is not set", args.key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "cloudjob",
            "run",
            "--workdir",
            "/tmp/job",
            "--",
            "python3",
            "tokenize.py",
            "--lang",
            "grc",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.workdir, PathBuf::from("/tmp/job"));
                assert_eq!(args.command, vec!["python3", "tokenize.py", "--lang", "grc"]);
                assert!(args.output_key_prefix.is_none());
            }
            Commands::Metadata(_) => panic!("expected run command"),
        }
    }

    #[test]
    fn test_run_requires_program() {
        assert!(Cli::try_parse_from(["cloudjob", "run"]).is_err());
    }

    #[test]
    fn test_parse_metadata_command_with_global_log_level() {
        let cli = Cli::try_parse_from(["cloudjob", "metadata", "instance/zone", "--log-level", "debug"])
            .unwrap();
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Metadata(args) => assert_eq!(args.key, "instance/zone"),
            Commands::Run(_) => panic!("expected metadata command"),
        }
    }
}

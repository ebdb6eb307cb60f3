//! Ferry - import and migration worker

use anyhow::{Context, Result};
use clap::Parser;
use ferry_common::logging::{init_logging, LogConfig, LogLevel};
use ferry_worker::config::WorkerConfig;
use ferry_worker::jobs::{JobOutput, JobRequest, WorkerContext};
use ferry_worker::migration::StepOutcome;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(author, version, about = "Batch import and index migration worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Import a whole MySQL table
    ImportTable {
        #[command(flatten)]
        payloads: ImportPayloads,
    },

    /// Import the result of a MySQL SELECT
    ImportQuery {
        #[command(flatten)]
        payloads: ImportPayloads,
    },

    /// Import a search index
    ImportSearch {
        #[command(flatten)]
        payloads: ImportPayloads,
    },

    /// Run a migration plan and wait for every step
    Migrate {
        /// JSON file holding the list of steps
        #[arg(short, long)]
        plan: PathBuf,

        #[command(flatten)]
        target: MigrationTarget,
    },

    /// Run a single migration step
    Step {
        /// Registered worker name
        #[arg(short, long)]
        worker: String,

        /// JSON file holding the step
        #[arg(short, long)]
        schema: PathBuf,

        #[command(flatten)]
        target: MigrationTarget,
    },

    /// Run a job request file
    Run {
        /// JSON file holding a tagged job request
        #[arg(short, long)]
        job: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct ImportPayloads {
    /// Import config JSON file
    #[arg(short, long)]
    config: PathBuf,

    /// Credentials JSON file
    #[arg(long)]
    credentials: PathBuf,
}

#[derive(clap::Args, Debug)]
struct MigrationTarget {
    /// Search cluster base URL
    #[arg(long, env = "FERRY_ELASTIC_HOST")]
    elastic_host: String,

    /// Index that tracks migration tasks
    #[arg(long, env = "FERRY_TASK_INDEX", default_value = "tasks")]
    task_index: String,
}

async fn read_json(path: &Path) -> Result<Value> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

async fn import_payloads(payloads: &ImportPayloads) -> Result<(Value, Value)> {
    Ok((
        read_json(&payloads.config).await?,
        read_json(&payloads.credentials).await?,
    ))
}

async fn build_request(command: Command) -> Result<JobRequest> {
    Ok(match command {
        Command::ImportTable { payloads } => {
            let (import_config, credentials) = import_payloads(&payloads).await?;
            JobRequest::TableImport {
                import_config,
                credentials,
            }
        },
        Command::ImportQuery { payloads } => {
            let (import_config, credentials) = import_payloads(&payloads).await?;
            JobRequest::QueryImport {
                import_config,
                credentials,
            }
        },
        Command::ImportSearch { payloads } => {
            let (import_config, credentials) = import_payloads(&payloads).await?;
            JobRequest::SearchImport {
                import_config,
                credentials,
            }
        },
        Command::Migrate { plan, target } => {
            let schemas: Vec<Value> = serde_json::from_value(read_json(&plan).await?)
                .context("Migration plan must be a JSON array of steps")?;
            JobRequest::MigrationPlan {
                schemas,
                elastic_host: target.elastic_host,
                task_index: target.task_index,
            }
        },
        Command::Step {
            worker,
            schema,
            target,
        } => JobRequest::MigrationStep {
            worker,
            schema: read_json(&schema).await?,
            elastic_host: target.elastic_host,
            task_index: target.task_index,
        },
        Command::Run { job } => serde_json::from_value(read_json(&job).await?)
            .context("Job file is not a valid job request")?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("ferry-worker")
        .build();

    // Environment variables take precedence
    let log_config = LogConfig::from_env_or(log_config)?;
    let _guard = init_logging(&log_config)?;

    let ctx = WorkerContext::new(WorkerConfig::load()?)?;
    let request = build_request(cli.command).await?;
    info!(?request, "Dispatching job");

    match request.dispatch(&ctx).await? {
        JobOutput::Import { job, summary } => {
            info!(
                %job,
                batches = summary.batches,
                records = summary.records,
                delivered = summary.delivered,
                failed = summary.failed,
                "Import complete"
            );
        },
        JobOutput::Plan { job, submission } => {
            info!(%job, tasks = submission.submitted(), "Plan submitted, waiting for steps");
            let reports = submission.wait().await?;
            let failed: Vec<&str> = reports
                .iter()
                .filter(|r| r.outcome.is_failed())
                .map(|r| r.step.as_str())
                .collect();

            if !failed.is_empty() {
                error!(%job, ?failed, "Migration finished with failed steps");
                anyhow::bail!("{} of {} migration steps failed", failed.len(), reports.len());
            }
            info!(%job, steps = reports.len(), "Migration complete");
        },
        JobOutput::Step { job, outcome } => match outcome {
            StepOutcome::Completed => info!(%job, "Migration step complete"),
            StepOutcome::Skipped { reason } => info!(%job, reason = %reason, "Migration step skipped"),
            StepOutcome::Failed { error } => anyhow::bail!("Migration step failed: {}", error),
        },
    }

    Ok(())
}

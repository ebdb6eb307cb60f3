//! Job entry points
//!
//! Each entry point takes plain JSON payloads, so a job can arrive from a
//! queue, a file or a test without sharing types with the caller. Import
//! configs and credentials always travel as two separate payloads.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::error::{MigrationError, WorkerResult};
use crate::import::{
    ElasticCredentials, ElasticImporter, ElasticImporterConfig, HttpBatchDeliverer, ImportConfig,
    ImportDispatcher, ImportSummary, Importer, MySqlCredentials, MySqlQueryConfig,
    MySqlQueryImporter, MySqlTableConfig, MySqlTableImporter,
};
use crate::migration::{
    ElasticAuditor, MigrationOrchestrator, MigrationPlan, MigrationSchema, PlanAuditor,
    PlanSubmission, StepInvocation, StepOutcome, StepRunner, TaskExecutor, TokioExecutor,
    WorkerRegistry,
};
use crate::progress::{JobHandle, JobTracker, ProgressReporter, ProgressTracker};

/// Shared services for every job the worker runs
#[derive(Clone)]
pub struct WorkerContext {
    pub config: WorkerConfig,
    pub client: Client,
    pub tracker: Arc<JobTracker>,
    pub runner: StepRunner,
    pub executor: Arc<dyn TaskExecutor>,
    pub auditor: Arc<dyn PlanAuditor>,
}

impl WorkerContext {
    /// Context with the built-in workers and the search cluster auditor
    pub fn new(config: WorkerConfig) -> WorkerResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http.timeout_secs))
            .build()?;
        let registry = WorkerRegistry::with_builtin_workers(client.clone());
        let auditor: Arc<dyn PlanAuditor> = Arc::new(ElasticAuditor::new(client.clone()));
        Ok(Self::with_parts(config, client, registry, auditor))
    }

    /// Context from explicit parts, with a [`TokioExecutor`]
    pub fn with_parts(
        config: WorkerConfig,
        client: Client,
        registry: WorkerRegistry,
        auditor: Arc<dyn PlanAuditor>,
    ) -> Self {
        let tracker = Arc::new(JobTracker::new());
        let runner = StepRunner::new(registry, auditor.clone());
        let executor: Arc<dyn TaskExecutor> = Arc::new(TokioExecutor::new(
            runner.clone(),
            tracker.clone(),
            config.chain_policy,
        ));

        Self {
            config,
            client,
            tracker,
            runner,
            executor,
            auditor,
        }
    }

    /// Replace the executor steps are submitted to
    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn orchestrator(&self) -> MigrationOrchestrator {
        MigrationOrchestrator::new(self.executor.clone(), self.auditor.clone())
    }

    /// Progress tracker bound to `job` in this context's tracker
    pub fn progress_for(&self, job: JobHandle) -> ProgressTracker {
        let reporter: Arc<dyn ProgressReporter> = self.tracker.clone();
        ProgressTracker::bound(job, reporter)
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("config", &self.config)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Imports
// ============================================================================

/// Decode the import config; `None` when the import is disabled
fn load_import_config(payload: Value) -> WorkerResult<Option<ImportConfig>> {
    let config = ImportConfig::from_payload(payload)?;
    if !config.enabled {
        warn!(import = %config.name, "Import is disabled, skipping");
        return Ok(None);
    }
    Ok(Some(config))
}

async fn dispatch_import<I: Importer>(
    ctx: &WorkerContext,
    importer: I,
    config: &ImportConfig,
    progress: &ProgressTracker,
) -> WorkerResult<ImportSummary> {
    let deliverer = HttpBatchDeliverer::new(ctx.client.clone(), &ctx.config.delivery);
    let run = ImportDispatcher::new(importer, deliverer, config).run(&config.api_url);

    info!(
        import = %config.name,
        source = %config.event_source,
        destination = run.destination(),
        "Import starts"
    );
    run.drain(progress).await
}

/// Copy a whole MySQL table to the receiving API
pub async fn run_table_import(
    ctx: &WorkerContext,
    progress: &ProgressTracker,
    import_config: Value,
    credentials: Value,
) -> WorkerResult<ImportSummary> {
    let Some(config) = load_import_config(import_config)? else {
        return Ok(ImportSummary::default());
    };
    let table: MySqlTableConfig = config.importer_config()?;
    let credentials = MySqlCredentials::from_payload(credentials)?;

    let importer = MySqlTableImporter::connect(credentials, table, &ctx.config.database).await?;
    dispatch_import(ctx, importer, &config, progress).await
}

/// Copy the result of a MySQL `SELECT` to the receiving API
pub async fn run_query_import(
    ctx: &WorkerContext,
    progress: &ProgressTracker,
    import_config: Value,
    credentials: Value,
) -> WorkerResult<ImportSummary> {
    let Some(config) = load_import_config(import_config)? else {
        return Ok(ImportSummary::default());
    };
    let query: MySqlQueryConfig = config.importer_config()?;
    let credentials = MySqlCredentials::from_payload(credentials)?;

    let importer = MySqlQueryImporter::connect(credentials, query, &ctx.config.database).await?;
    dispatch_import(ctx, importer, &config, progress).await
}

/// Copy a search index to the receiving API
pub async fn run_search_import(
    ctx: &WorkerContext,
    progress: &ProgressTracker,
    import_config: Value,
    credentials: Value,
) -> WorkerResult<ImportSummary> {
    let Some(config) = load_import_config(import_config)? else {
        return Ok(ImportSummary::default());
    };
    let index: ElasticImporterConfig = config.importer_config()?;
    let credentials = ElasticCredentials::from_payload(credentials)?;

    let importer = ElasticImporter::new(
        ctx.client.clone(),
        credentials,
        index,
        ctx.config.search.scroll_keepalive.clone(),
    )?;
    dispatch_import(ctx, importer, &config, progress).await
}

// ============================================================================
// Migrations
// ============================================================================

/// Submit every step of a migration plan without waiting for them
pub async fn run_migration_plan(
    ctx: &WorkerContext,
    progress: &ProgressTracker,
    schemas: Vec<Value>,
    elastic_host: &str,
    task_index: &str,
) -> Result<PlanSubmission, MigrationError> {
    let plan = MigrationPlan::from_payloads(schemas)?;
    Ok(ctx
        .orchestrator()
        .submit_plan(&plan, elastic_host, task_index, progress))
}

/// Run one migration step in place
pub async fn run_migration_step(
    ctx: &WorkerContext,
    progress: &ProgressTracker,
    worker: &str,
    schema: Value,
    elastic_host: &str,
    task_index: &str,
) -> Result<StepOutcome, MigrationError> {
    let schema = MigrationSchema::from_payload(schema)?;
    let step = StepInvocation {
        worker: worker.to_string(),
        schema,
        elastic_host: elastic_host.to_string(),
        task_index: task_index.to_string(),
    };
    ctx.runner.execute(&step, progress.clone()).await
}

// ============================================================================
// Job requests
// ============================================================================

/// A job as it arrives from outside, one variant per entry point
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobRequest {
    TableImport {
        import_config: Value,
        credentials: Value,
    },
    QueryImport {
        import_config: Value,
        credentials: Value,
    },
    SearchImport {
        import_config: Value,
        credentials: Value,
    },
    MigrationPlan {
        schemas: Vec<Value>,
        elastic_host: String,
        task_index: String,
    },
    MigrationStep {
        /// Registered worker name
        worker: String,
        schema: Value,
        elastic_host: String,
        task_index: String,
    },
}

/// Result of a dispatched job
#[derive(Debug)]
pub enum JobOutput {
    Import {
        job: JobHandle,
        summary: ImportSummary,
    },
    /// Submission finished; the steps may still be running
    Plan {
        job: JobHandle,
        submission: PlanSubmission,
    },
    Step {
        job: JobHandle,
        outcome: StepOutcome,
    },
}

impl JobOutput {
    pub fn job(&self) -> JobHandle {
        match self {
            JobOutput::Import { job, .. }
            | JobOutput::Plan { job, .. }
            | JobOutput::Step { job, .. } => *job,
        }
    }
}

impl JobRequest {
    /// Label used in the job tracker and in logs
    pub fn label(&self) -> String {
        match self {
            JobRequest::TableImport { .. } => "MySQL table import".to_string(),
            JobRequest::QueryImport { .. } => "MySQL query import".to_string(),
            JobRequest::SearchImport { .. } => "Search index import".to_string(),
            JobRequest::MigrationPlan { schemas, .. } => {
                format!("Migration plan of {} steps", schemas.len())
            },
            JobRequest::MigrationStep { worker, .. } => format!("Migration step ({})", worker),
        }
    }

    /// Register the job, run it and record how it ended
    pub async fn dispatch(self, ctx: &WorkerContext) -> WorkerResult<JobOutput> {
        let job = ctx.tracker.register(self.label());
        ctx.tracker.mark_running(job);
        let progress = ctx.progress_for(job);

        let result = self.execute(ctx, job, &progress).await;
        match &result {
            Ok(JobOutput::Step {
                outcome: StepOutcome::Skipped { reason },
                ..
            }) => ctx.tracker.mark_skipped(job, reason.clone()),
            Ok(_) => ctx.tracker.mark_succeeded(job),
            Err(e) => ctx.tracker.mark_failed(job, e.to_string()),
        }
        result
    }

    async fn execute(
        self,
        ctx: &WorkerContext,
        job: JobHandle,
        progress: &ProgressTracker,
    ) -> WorkerResult<JobOutput> {
        Ok(match self {
            JobRequest::TableImport {
                import_config,
                credentials,
            } => JobOutput::Import {
                job,
                summary: run_table_import(ctx, progress, import_config, credentials).await?,
            },
            JobRequest::QueryImport {
                import_config,
                credentials,
            } => JobOutput::Import {
                job,
                summary: run_query_import(ctx, progress, import_config, credentials).await?,
            },
            JobRequest::SearchImport {
                import_config,
                credentials,
            } => JobOutput::Import {
                job,
                summary: run_search_import(ctx, progress, import_config, credentials).await?,
            },
            JobRequest::MigrationPlan {
                schemas,
                elastic_host,
                task_index,
            } => JobOutput::Plan {
                job,
                submission: run_migration_plan(ctx, progress, schemas, &elastic_host, &task_index)
                    .await?,
            },
            JobRequest::MigrationStep {
                worker,
                schema,
                elastic_host,
                task_index,
            } => JobOutput::Step {
                job,
                outcome: run_migration_step(
                    ctx,
                    progress,
                    &worker,
                    schema,
                    &elastic_host,
                    &task_index,
                )
                .await?,
            },
        })
    }
}

impl std::fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobRequest::TableImport { .. }
            | JobRequest::QueryImport { .. }
            | JobRequest::SearchImport { .. } => f
                .debug_struct("JobRequest")
                .field("job", &self.label())
                .field("credentials", &"<redacted>")
                .finish(),
            JobRequest::MigrationPlan {
                schemas,
                elastic_host,
                task_index,
            } => f
                .debug_struct("JobRequest")
                .field("job", &self.label())
                .field("steps", &schemas.len())
                .field("elastic_host", elastic_host)
                .field("task_index", task_index)
                .finish(),
            JobRequest::MigrationStep {
                worker,
                elastic_host,
                task_index,
                ..
            } => f
                .debug_struct("JobRequest")
                .field("worker", worker)
                .field("elastic_host", elastic_host)
                .field("task_index", task_index)
                .finish(),
        }
    }
}

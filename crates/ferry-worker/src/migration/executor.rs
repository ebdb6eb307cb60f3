//! Step execution
//!
//! [`StepRunner`] runs a single step: it resolves the worker and calls it.
//! [`TaskExecutor`] decides where and when steps run. The shipped executor,
//! [`TokioExecutor`], spawns one task per asynchronous step and one task per
//! chain, and records every step in the [`JobTracker`].

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::audit::PlanAuditor;
use super::registry::{StepContext, WorkerRegistry};
use super::schema::MigrationSchema;
use crate::error::MigrationError;
use crate::progress::{JobHandle, JobTracker, ProgressReporter, ProgressTracker};

/// Everything needed to run one step somewhere else
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInvocation {
    pub worker: String,
    pub schema: MigrationSchema,
    pub elastic_host: String,
    pub task_index: String,
}

impl StepInvocation {
    pub fn new(schema: &MigrationSchema, elastic_host: &str, task_index: &str) -> Self {
        Self {
            worker: schema.worker.clone(),
            schema: schema.clone(),
            elastic_host: elastic_host.to_string(),
            task_index: task_index.to_string(),
        }
    }

    pub fn label(&self) -> String {
        format!("Migration step {} ({})", self.schema.name, self.worker)
    }
}

/// Synchronous steps, run one after another in insertion order
#[derive(Debug, Clone, Default)]
pub struct SyncChain {
    links: Vec<StepInvocation>,
}

impl SyncChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: StepInvocation) {
        self.links.push(step);
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn links(&self) -> &[StepInvocation] {
        &self.links
    }

    pub fn into_links(self) -> Vec<StepInvocation> {
        self.links
    }
}

/// How a step ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Skipped { reason: String },
    Failed { error: String },
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }
}

/// Final record of one executed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub worker: String,
    pub step: String,
    pub job: JobHandle,
    pub outcome: StepOutcome,
}

/// What to do with the rest of a chain after a step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChainPolicy {
    #[default]
    #[serde(rename = "halt")]
    HaltOnFailure,
    #[serde(rename = "continue")]
    ContinueOnFailure,
}

impl FromStr for ChainPolicy {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "halt" => Ok(ChainPolicy::HaltOnFailure),
            "continue" => Ok(ChainPolicy::ContinueOnFailure),
            other => Err(MigrationError::Configuration(format!(
                "unknown chain policy '{}', expected 'halt' or 'continue'",
                other
            ))),
        }
    }
}

/// Handle to submitted work
#[derive(Debug)]
pub struct TaskHandle {
    job: JobHandle,
    completion: Option<JoinHandle<Vec<StepReport>>>,
}

impl TaskHandle {
    pub fn new(job: JobHandle, completion: JoinHandle<Vec<StepReport>>) -> Self {
        Self {
            job,
            completion: Some(completion),
        }
    }

    /// A handle whose work runs out of reach, e.g. on a remote queue
    pub fn detached(job: JobHandle) -> Self {
        Self {
            job,
            completion: None,
        }
    }

    pub fn job(&self) -> JobHandle {
        self.job
    }

    /// Wait for the submitted work and collect its step reports.
    ///
    /// Detached handles return no reports.
    pub async fn wait(self) -> Result<Vec<StepReport>, MigrationError> {
        match self.completion {
            Some(completion) => completion
                .await
                .map_err(|e| MigrationError::StepExecution(format!("job {}: {}", self.job, e))),
            None => Ok(Vec::new()),
        }
    }
}

/// Places steps somewhere to run. Submission never waits for the step.
pub trait TaskExecutor: Send + Sync {
    fn submit(&self, step: StepInvocation) -> TaskHandle;

    fn submit_chain(&self, chain: SyncChain) -> TaskHandle;
}

// ============================================================================
// Step runner
// ============================================================================

/// Resolves and runs single steps
#[derive(Clone)]
pub struct StepRunner {
    registry: WorkerRegistry,
    auditor: Arc<dyn PlanAuditor>,
}

impl StepRunner {
    pub fn new(registry: WorkerRegistry, auditor: Arc<dyn PlanAuditor>) -> Self {
        Self { registry, auditor }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Run one step.
    ///
    /// An unknown worker is logged and the step ends as skipped; worker
    /// failures are returned to the caller.
    pub async fn execute(
        &self,
        step: &StepInvocation,
        progress: ProgressTracker,
    ) -> Result<StepOutcome, MigrationError> {
        let worker = match self.registry.resolve(&step.worker) {
            Ok(worker) => worker,
            Err(e) => {
                error!(
                    worker = %step.worker,
                    step = %step.schema.name,
                    "No migration worker defined for name {}. Skipping migration with name {}",
                    step.worker,
                    step.schema.name
                );
                return Ok(StepOutcome::Skipped {
                    reason: e.to_string(),
                });
            },
        };

        let ctx = StepContext {
            progress,
            auditor: self.auditor.clone(),
        };
        worker
            .run(&ctx, &step.schema, &step.elastic_host, &step.task_index)
            .await?;

        Ok(StepOutcome::Completed)
    }
}

impl std::fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunner")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tokio executor
// ============================================================================

/// In-process executor backed by tokio tasks.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    runner: StepRunner,
    tracker: Arc<JobTracker>,
    policy: ChainPolicy,
}

impl TokioExecutor {
    pub fn new(runner: StepRunner, tracker: Arc<JobTracker>, policy: ChainPolicy) -> Self {
        Self {
            runner,
            tracker,
            policy,
        }
    }
}

impl TaskExecutor for TokioExecutor {
    fn submit(&self, step: StepInvocation) -> TaskHandle {
        let job = self.tracker.register(step.label());
        let runner = self.runner.clone();
        let tracker = self.tracker.clone();

        TaskHandle::new(
            job,
            tokio::spawn(async move { vec![run_tracked(&runner, &tracker, job, &step).await] }),
        )
    }

    fn submit_chain(&self, chain: SyncChain) -> TaskHandle {
        let chain_job = self
            .tracker
            .register(format!("Migration chain of {} steps", chain.len()));
        let links: Vec<(JobHandle, StepInvocation)> = chain
            .into_links()
            .into_iter()
            .map(|step| (self.tracker.register(step.label()), step))
            .collect();

        let runner = self.runner.clone();
        let tracker = self.tracker.clone();
        let policy = self.policy;

        TaskHandle::new(
            chain_job,
            tokio::spawn(async move { run_chain(&runner, &tracker, policy, chain_job, links).await }),
        )
    }
}

async fn run_chain(
    runner: &StepRunner,
    tracker: &Arc<JobTracker>,
    policy: ChainPolicy,
    chain_job: JobHandle,
    links: Vec<(JobHandle, StepInvocation)>,
) -> Vec<StepReport> {
    tracker.mark_running(chain_job);
    let mut reports = Vec::with_capacity(links.len());
    let mut links = links.into_iter();

    while let Some((job, step)) = links.next() {
        let report = run_tracked(runner, tracker, job, &step).await;
        let failed = report.outcome.is_failed();
        reports.push(report);

        if failed && policy == ChainPolicy::HaltOnFailure {
            let reason = format!("chain halted after step {} failed", step.schema.name);
            let remaining: Vec<(JobHandle, StepInvocation)> = links.by_ref().collect();
            if !remaining.is_empty() {
                let names: Vec<&str> = remaining.iter().map(|(_, s)| s.schema.name.as_str()).collect();
                warn!(failed = %step.schema.name, remaining = ?names, "Halting migration chain");
            }
            for (job, step) in remaining {
                tracker.mark_skipped(job, reason.clone());
                reports.push(StepReport {
                    worker: step.worker,
                    step: step.schema.name,
                    job,
                    outcome: StepOutcome::Skipped {
                        reason: reason.clone(),
                    },
                });
            }
        }
    }

    match reports.iter().find(|r| r.outcome.is_failed()) {
        Some(failed) => tracker.mark_failed(chain_job, format!("step {} failed", failed.step)),
        None => tracker.mark_succeeded(chain_job),
    }
    reports
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Run one step and record its outcome against `job`.
///
/// A panicking worker ends its step as failed; the task running the step
/// carries on.
async fn run_tracked(
    runner: &StepRunner,
    tracker: &Arc<JobTracker>,
    job: JobHandle,
    step: &StepInvocation,
) -> StepReport {
    tracker.mark_running(job);
    let reporter: Arc<dyn ProgressReporter> = tracker.clone();

    let execution = AssertUnwindSafe(runner.execute(step, ProgressTracker::bound(job, reporter)))
        .catch_unwind()
        .await;

    let outcome = match execution {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            error!(worker = %step.worker, step = %step.schema.name, %job, error = %e, "Migration step failed");
            StepOutcome::Failed {
                error: e.to_string(),
            }
        },
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(worker = %step.worker, step = %step.schema.name, %job, panic = message, "Migration worker panicked");
            StepOutcome::Failed {
                error: format!("worker {} panicked: {}", step.worker, message),
            }
        },
    };

    match &outcome {
        StepOutcome::Completed => {
            info!(worker = %step.worker, step = %step.schema.name, %job, "Migration step completed");
            tracker.mark_succeeded(job);
        },
        StepOutcome::Skipped { reason } => tracker.mark_skipped(job, reason.clone()),
        StepOutcome::Failed { error } => tracker.mark_failed(job, error.clone()),
    }

    StepReport {
        worker: step.worker.clone(),
        step: step.schema.name.clone(),
        job,
        outcome,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::migration::audit::NoopAuditor;
    use crate::migration::registry::MigrationWorker;
    use crate::progress::JobState;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        ran: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    struct RecordingWorker {
        recorder: Arc<Recorder>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl MigrationWorker for RecordingWorker {
        async fn run(
            &self,
            ctx: &StepContext,
            schema: &MigrationSchema,
            _elastic_host: &str,
            _task_index: &str,
        ) -> Result<(), MigrationError> {
            let now = self.recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.recorder.max_in_flight.fetch_max(now, Ordering::SeqCst);

            ctx.progress.update(0, Some(1));
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.recorder.ran.lock().unwrap().push(schema.name.clone());
            ctx.progress.update(1, Some(1));

            self.recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail_on == Some(schema.name.as_str()) {
                return Err(MigrationError::StepExecution(format!("{} broke", schema.name)));
            }
            Ok(())
        }
    }

    struct PanickingWorker;

    #[async_trait]
    impl MigrationWorker for PanickingWorker {
        async fn run(
            &self,
            _ctx: &StepContext,
            _schema: &MigrationSchema,
            _elastic_host: &str,
            _task_index: &str,
        ) -> Result<(), MigrationError> {
            panic!("worker bug");
        }
    }

    fn step(name: &str, worker: &str) -> StepInvocation {
        let schema = MigrationSchema::from_payload(json!({
            "name": name,
            "worker": worker,
            "copy_index": { "from_index": format!("{name}-a"), "to_index": format!("{name}-b") }
        }))
        .unwrap();
        StepInvocation::new(&schema, "http://search:9200", "tasks")
    }

    fn executor(
        fail_on: Option<&'static str>,
        policy: ChainPolicy,
    ) -> (TokioExecutor, Arc<Recorder>, Arc<JobTracker>) {
        let recorder = Arc::new(Recorder::default());
        let registry = WorkerRegistry::builder()
            .register(
                "record",
                Arc::new(RecordingWorker {
                    recorder: recorder.clone(),
                    fail_on,
                }),
            )
            .register("boom", Arc::new(PanickingWorker))
            .build();
        let tracker = Arc::new(JobTracker::new());
        let runner = StepRunner::new(registry, Arc::new(NoopAuditor));
        (TokioExecutor::new(runner, tracker.clone(), policy), recorder, tracker)
    }

    fn chain(names: &[&str]) -> SyncChain {
        let mut chain = SyncChain::new();
        for name in names {
            chain.push(step(name, "record"));
        }
        chain
    }

    #[tokio::test]
    async fn test_chain_runs_in_order_one_at_a_time() {
        let (executor, recorder, tracker) = executor(None, ChainPolicy::HaltOnFailure);

        let handle = executor.submit_chain(chain(&["s1", "s2", "s3"]));
        let chain_job = handle.job();
        let reports = handle.wait().await.unwrap();

        assert_eq!(recorder.ran.lock().unwrap().clone(), vec!["s1", "s2", "s3"]);
        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(reports.iter().all(|r| r.outcome == StepOutcome::Completed));
        assert_eq!(tracker.state(chain_job), Some(JobState::Succeeded));

        let step_progress = tracker.progress(reports[0].job).unwrap();
        assert_eq!((step_progress.current, step_progress.total), (1, Some(1)));
    }

    #[tokio::test]
    async fn test_halt_policy_skips_rest_of_chain() {
        let (executor, recorder, tracker) = executor(Some("s2"), ChainPolicy::HaltOnFailure);

        let reports = executor
            .submit_chain(chain(&["s1", "s2", "s3"]))
            .wait()
            .await
            .unwrap();

        assert_eq!(recorder.ran.lock().unwrap().clone(), vec!["s1", "s2"]);
        assert_eq!(reports.len(), 3);
        assert!(reports[1].outcome.is_failed());
        assert!(matches!(reports[2].outcome, StepOutcome::Skipped { .. }));
        assert!(matches!(tracker.state(reports[1].job), Some(JobState::Failed { .. })));
        assert!(matches!(tracker.state(reports[2].job), Some(JobState::Skipped { .. })));
    }

    #[tokio::test]
    async fn test_continue_policy_runs_every_link() {
        let (executor, recorder, tracker) = executor(Some("s1"), ChainPolicy::ContinueOnFailure);

        let handle = executor.submit_chain(chain(&["s1", "s2"]));
        let chain_job = handle.job();
        let reports = handle.wait().await.unwrap();

        assert_eq!(recorder.ran.lock().unwrap().clone(), vec!["s1", "s2"]);
        assert_eq!(reports[1].outcome, StepOutcome::Completed);
        assert!(matches!(tracker.state(chain_job), Some(JobState::Failed { .. })));
    }

    #[tokio::test]
    async fn test_missing_worker_is_skipped_not_failed() {
        let (executor, recorder, tracker) = executor(None, ChainPolicy::HaltOnFailure);

        let mut links = chain(&["s1"]);
        links.push(step("ghost-step", "ghost"));
        links.push(step("s3", "record"));
        let reports = executor.submit_chain(links).wait().await.unwrap();

        assert_eq!(recorder.ran.lock().unwrap().clone(), vec!["s1", "s3"]);
        match &reports[1].outcome {
            StepOutcome::Skipped { reason } => {
                assert_eq!(reason, "No migration worker defined for name ghost")
            },
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(tracker.state(reports[1].job), Some(JobState::Skipped { .. })));
    }

    #[tokio::test]
    async fn test_submit_tracks_single_step() {
        let (executor, _recorder, tracker) = executor(Some("solo"), ChainPolicy::HaltOnFailure);

        let handle = executor.submit(step("solo", "record"));
        let job = handle.job();
        let reports = handle.wait().await.unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].job, job);
        assert!(matches!(tracker.state(job), Some(JobState::Failed { error }) if error.contains("solo broke")));
    }

    #[tokio::test]
    async fn test_panicking_worker_fails_its_step_only() {
        let (executor, recorder, tracker) = executor(None, ChainPolicy::ContinueOnFailure);

        let mut links = chain(&["a"]);
        links.push(step("crash", "boom"));
        links.push(step("c", "record"));
        let handle = executor.submit_chain(links);
        let chain_job = handle.job();
        let reports = handle.wait().await.unwrap();

        assert_eq!(recorder.ran.lock().unwrap().clone(), vec!["a", "c"]);
        match &reports[1].outcome {
            StepOutcome::Failed { error } => assert!(error.contains("worker bug")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(reports[2].outcome, StepOutcome::Completed);
        assert!(matches!(tracker.state(reports[1].job), Some(JobState::Failed { .. })));
        assert!(matches!(tracker.state(chain_job), Some(JobState::Failed { .. })));
    }

    #[tokio::test]
    async fn test_panicking_worker_halts_chain_like_a_failure() {
        let (executor, recorder, tracker) = executor(None, ChainPolicy::HaltOnFailure);

        let mut links = chain(&["a"]);
        links.push(step("crash", "boom"));
        links.push(step("c", "record"));
        let reports = executor.submit_chain(links).wait().await.unwrap();

        assert_eq!(recorder.ran.lock().unwrap().clone(), vec!["a"]);
        assert!(reports[1].outcome.is_failed());
        assert!(matches!(tracker.state(reports[2].job), Some(JobState::Skipped { .. })));
    }

    #[test]
    fn test_chain_policy_parse() {
        assert_eq!("halt".parse::<ChainPolicy>().unwrap(), ChainPolicy::HaltOnFailure);
        assert_eq!(" Continue ".parse::<ChainPolicy>().unwrap(), ChainPolicy::ContinueOnFailure);
        assert!("retry".parse::<ChainPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_detached_handle_has_no_reports() {
        let reports = TaskHandle::detached(JobHandle::new()).wait().await.unwrap();
        assert!(reports.is_empty());
    }
}

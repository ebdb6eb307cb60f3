//! Migration plan orchestration
//!
//! Turns a plan into submissions: asynchronous steps go to the executor one
//! by one as they are met, synchronous steps are collected into a single
//! chain submitted after the walk. Nothing here waits for a step to finish,
//! and the plan's audit registration runs in its own task.

use ferry_common::types::ProgressState;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::audit::PlanAuditor;
use super::executor::{StepInvocation, StepReport, SyncChain, TaskExecutor, TaskHandle};
use super::schema::MigrationPlan;
use crate::error::MigrationError;
use crate::progress::ProgressTracker;

/// Label the plan is registered under in the task index
pub const ORCHESTRATOR_LABEL: &str = "Migration plan orchestrator";

/// Submits migration plans
#[derive(Clone)]
pub struct MigrationOrchestrator {
    executor: Arc<dyn TaskExecutor>,
    auditor: Arc<dyn PlanAuditor>,
}

/// What one call to [`MigrationOrchestrator::submit_plan`] put in motion
#[derive(Debug)]
pub struct PlanSubmission {
    /// Asynchronous steps, in submission order
    pub independent: Vec<TaskHandle>,
    /// The chain of synchronous steps, if the plan had any
    pub chain: Option<TaskHandle>,
    /// Plan progress at the end of submission
    pub progress: ProgressState,
    /// Registration of the plan in the task index
    pub registration: Option<JoinHandle<()>>,
}

impl PlanSubmission {
    /// Number of tasks handed to the executor
    pub fn submitted(&self) -> usize {
        self.independent.len() + usize::from(self.chain.is_some())
    }

    /// Wait for every submitted task and collect the step reports.
    ///
    /// Every handle is awaited even when one of them fails; the first
    /// failure is returned after that.
    pub async fn wait(self) -> Result<Vec<StepReport>, MigrationError> {
        let mut reports = Vec::new();
        let mut first_error = None;

        for handle in self.independent.into_iter().chain(self.chain) {
            match handle.wait().await {
                Ok(step_reports) => reports.extend(step_reports),
                Err(e) => {
                    error!(error = %e, "Migration task ended abnormally");
                    first_error.get_or_insert(e);
                },
            }
        }

        if let Some(registration) = self.registration {
            if let Err(e) = registration.await {
                warn!(error = %e, "Migration plan registration task ended abnormally");
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }
}

impl MigrationOrchestrator {
    pub fn new(executor: Arc<dyn TaskExecutor>, auditor: Arc<dyn PlanAuditor>) -> Self {
        Self { executor, auditor }
    }

    /// Submit every step of `plan`.
    ///
    /// Progress goes from `(0, n)` to `(n, n)`, one increment per step,
    /// whatever later happens to the steps themselves.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit_plan(
        &self,
        plan: &MigrationPlan,
        elastic_host: &str,
        task_index: &str,
        progress: &ProgressTracker,
    ) -> PlanSubmission {
        info!(steps = plan.len(), "Migration starts");
        for schema in plan.steps() {
            info!(
                "Scheduled migration of {} to {}",
                schema.copy_index.from_index, schema.copy_index.to_index
            );
        }

        let total = plan.len() as u64;
        let mut state = ProgressState::new(Some(total));
        progress.update(state.current, state.total);

        let registration = self.spawn_registration(elastic_host, task_index, progress);

        let mut independent = Vec::new();
        let mut chain = SyncChain::new();

        for schema in plan.steps() {
            let step = StepInvocation::new(schema, elastic_host, task_index);
            if schema.asynchronous {
                let handle = self.executor.submit(step);
                info!(
                    step = %schema.name,
                    "Running worker {} as job {}",
                    schema.worker,
                    handle.job()
                );
                independent.push(handle);
            } else {
                chain.push(step);
            }

            state.advance(state.current + 1, None);
            progress.update(state.current, state.total);
        }

        let chain = if chain.is_empty() {
            None
        } else {
            info!(steps = chain.len(), "Submitting synchronous migration chain");
            Some(self.executor.submit_chain(chain))
        };

        PlanSubmission {
            independent,
            chain,
            progress: state,
            registration: Some(registration),
        }
    }

    fn spawn_registration(
        &self,
        elastic_host: &str,
        task_index: &str,
        progress: &ProgressTracker,
    ) -> JoinHandle<()> {
        let auditor = self.auditor.clone();
        let elastic_host = elastic_host.to_string();
        let task_index = task_index.to_string();
        let job = progress.job();

        tokio::spawn(async move {
            if let Err(e) = auditor
                .register_task(&elastic_host, &task_index, ORCHESTRATOR_LABEL, job)
                .await
            {
                warn!(error = %e, "Could not register migration plan");
            }
        })
    }
}

impl std::fmt::Debug for MigrationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationOrchestrator").finish_non_exhaustive()
    }
}

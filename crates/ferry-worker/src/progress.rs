//! Job progress reporting
//!
//! A [`ProgressTracker`] is what importers and migration steps talk to. It is
//! either bound to a job handle and a [`ProgressReporter`], or detached, in
//! which case every update is dropped. Standalone runs and most tests use the
//! detached form.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use ferry_common::types::{ProgressChange, ProgressState};

/// Identifier of a tracked job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle(Uuid);

impl JobHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Sink for `(current, total)` progress updates
pub trait ProgressReporter: Send + Sync {
    fn update(&self, job: JobHandle, current: u64, total: Option<u64>);
}

/// Progress capability handed to a running job
#[derive(Clone)]
pub struct ProgressTracker {
    binding: Option<(JobHandle, Arc<dyn ProgressReporter>)>,
}

impl ProgressTracker {
    /// A tracker with no job behind it; updates are no-ops
    pub fn detached() -> Self {
        Self { binding: None }
    }

    pub fn bound(job: JobHandle, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            binding: Some((job, reporter)),
        }
    }

    pub fn job(&self) -> Option<JobHandle> {
        self.binding.as_ref().map(|(job, _)| *job)
    }

    pub fn update(&self, current: u64, total: Option<u64>) {
        if let Some((job, reporter)) = &self.binding {
            reporter.update(*job, current, total);
        }
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("job", &self.job())
            .finish()
    }
}

// ============================================================================
// Job tracker
// ============================================================================

/// Lifecycle of a tracked job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Skipped { reason: String },
    Failed { error: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Skipped { .. } | JobState::Failed { .. }
        )
    }
}

/// Snapshot of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub label: String,
    pub state: JobState,
    pub progress: ProgressState,
}

/// In-process job status store.
///
/// Plays the part of a task-queue result backend: every job the worker runs
/// is registered here, progress updates land here, and step failures that the
/// orchestrator does not handle end up here as [`JobState::Failed`].
#[derive(Debug, Default)]
pub struct JobTracker {
    jobs: RwLock<HashMap<JobHandle, JobRecord>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending job
    pub fn register(&self, label: impl Into<String>) -> JobHandle {
        let job = JobHandle::new();
        let label = label.into();
        debug!(%job, label = %label, "Registered job");
        self.write().insert(
            job,
            JobRecord {
                label,
                state: JobState::Pending,
                progress: ProgressState::default(),
            },
        );
        job
    }

    pub fn get(&self, job: JobHandle) -> Option<JobRecord> {
        self.read().get(&job).cloned()
    }

    pub fn state(&self, job: JobHandle) -> Option<JobState> {
        self.read().get(&job).map(|record| record.state.clone())
    }

    pub fn progress(&self, job: JobHandle) -> Option<ProgressState> {
        self.read().get(&job).map(|record| record.progress)
    }

    pub fn mark_running(&self, job: JobHandle) {
        self.transition(job, JobState::Running);
    }

    pub fn mark_succeeded(&self, job: JobHandle) {
        self.transition(job, JobState::Succeeded);
    }

    pub fn mark_skipped(&self, job: JobHandle, reason: impl Into<String>) {
        self.transition(
            job,
            JobState::Skipped {
                reason: reason.into(),
            },
        );
    }

    pub fn mark_failed(&self, job: JobHandle, error: impl Into<String>) {
        self.transition(
            job,
            JobState::Failed {
                error: error.into(),
            },
        );
    }

    fn transition(&self, job: JobHandle, state: JobState) {
        let mut jobs = self.write();
        match jobs.get_mut(&job) {
            Some(record) if record.state.is_terminal() => {
                warn!(%job, from = ?record.state, to = ?state, "Ignoring transition out of a terminal state");
            },
            Some(record) => record.state = state,
            None => warn!(%job, "Transition for unknown job"),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobHandle, JobRecord>> {
        self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobHandle, JobRecord>> {
        self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ProgressReporter for JobTracker {
    fn update(&self, job: JobHandle, current: u64, total: Option<u64>) {
        let mut jobs = self.write();
        let Some(record) = jobs.get_mut(&job) else {
            warn!(%job, current, "Progress update for unknown job");
            return;
        };

        match record.progress.advance(current, total) {
            ProgressChange::Applied => {
                debug!(%job, current, total = ?record.progress.total, "Progress");
            },
            ProgressChange::Clamped => {
                warn!(%job, current, total = ?record.progress.total, "Progress clamped to total");
            },
            ProgressChange::Regressed => {
                warn!(%job, current, recorded = record.progress.current, "Ignoring progress regression");
            },
        }

        if record.state == JobState::Pending {
            record.state = JobState::Running;
        }
    }
}

//! Migration worker registry
//!
//! Steps name their worker by string. The registry maps those names to
//! implementations; the table is fixed once built.

use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::audit::PlanAuditor;
use super::schema::MigrationSchema;
use super::workers::ReindexWorker;
use crate::error::MigrationError;
use crate::progress::ProgressTracker;

/// What a worker gets besides its schema
#[derive(Clone)]
pub struct StepContext {
    pub progress: ProgressTracker,
    pub auditor: Arc<dyn PlanAuditor>,
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

/// A named migration routine
#[async_trait]
pub trait MigrationWorker: Send + Sync {
    async fn run(
        &self,
        ctx: &StepContext,
        schema: &MigrationSchema,
        elastic_host: &str,
        task_index: &str,
    ) -> Result<(), MigrationError>;
}

/// Workers shipped with the binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinWorker {
    Reindex,
    ReindexWithScript,
}

impl BuiltinWorker {
    pub const ALL: [BuiltinWorker; 2] = [BuiltinWorker::Reindex, BuiltinWorker::ReindexWithScript];

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinWorker::Reindex => "reindex",
            BuiltinWorker::ReindexWithScript => "reindex_with_script",
        }
    }

    fn build(&self, client: Client) -> Arc<dyn MigrationWorker> {
        match self {
            BuiltinWorker::Reindex => Arc::new(ReindexWorker::new(client, false)),
            BuiltinWorker::ReindexWithScript => Arc::new(ReindexWorker::new(client, true)),
        }
    }
}

impl fmt::Display for BuiltinWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BuiltinWorker {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuiltinWorker::ALL
            .into_iter()
            .find(|worker| worker.name() == s)
            .ok_or_else(|| MigrationError::WorkerNotFound(s.to_string()))
    }
}

/// Immutable name to worker table
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<HashMap<String, Arc<dyn MigrationWorker>>>,
}

impl WorkerRegistry {
    pub fn builder() -> WorkerRegistryBuilder {
        WorkerRegistryBuilder::default()
    }

    /// Registry holding every [`BuiltinWorker`]
    pub fn with_builtin_workers(client: Client) -> Self {
        BuiltinWorker::ALL
            .into_iter()
            .fold(Self::builder(), |builder, worker| {
                builder.register(worker.name(), worker.build(client.clone()))
            })
            .build()
    }

    /// Look up a worker by exact name
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn MigrationWorker>, MigrationError> {
        self.workers
            .get(name)
            .cloned()
            .ok_or_else(|| MigrationError::WorkerNotFound(name.to_string()))
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.names())
            .finish()
    }
}

/// Builder for [`WorkerRegistry`]
#[derive(Default)]
pub struct WorkerRegistryBuilder {
    workers: HashMap<String, Arc<dyn MigrationWorker>>,
}

impl WorkerRegistryBuilder {
    /// Register a worker; a later registration under the same name wins
    pub fn register(mut self, name: impl Into<String>, worker: Arc<dyn MigrationWorker>) -> Self {
        self.workers.insert(name.into(), worker);
        self
    }

    pub fn build(self) -> WorkerRegistry {
        WorkerRegistry {
            workers: Arc::new(self.workers),
        }
    }
}

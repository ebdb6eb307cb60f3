//! Migration path: plans of copy steps run through named workers

pub mod audit;
pub mod executor;
pub mod orchestrator;
pub mod registry;
pub mod schema;
pub mod workers;

pub use audit::{ElasticAuditor, NoopAuditor, PlanAuditor};
pub use executor::{
    ChainPolicy, StepInvocation, StepOutcome, StepReport, StepRunner, SyncChain, TaskExecutor,
    TaskHandle, TokioExecutor,
};
pub use orchestrator::{MigrationOrchestrator, PlanSubmission, ORCHESTRATOR_LABEL};
pub use registry::{BuiltinWorker, MigrationWorker, StepContext, WorkerRegistry};
pub use schema::{CopyIndex, MigrationPlan, MigrationSchema};
pub use workers::ReindexWorker;

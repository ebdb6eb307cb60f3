//! Task registration in the search cluster's task index
//!
//! Registration is fire-and-forget from the caller's point of view: callers
//! log a failed registration and carry on.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::MigrationError;
use crate::progress::JobHandle;

/// Records that a job was started
#[async_trait]
pub trait PlanAuditor: Send + Sync {
    async fn register_task(
        &self,
        host: &str,
        index: &str,
        label: &str,
        job: Option<JobHandle>,
    ) -> Result<(), MigrationError>;
}

/// Document written to the task index
#[derive(Debug, Serialize)]
struct TaskDocument<'a> {
    id: String,
    name: &'a str,
    timestamp: String,
    status: &'static str,
    progress: u64,
    #[serde(rename = "type")]
    kind: &'static str,
    task_id: Option<String>,
}

/// Writes task documents with the index API
#[derive(Debug, Clone)]
pub struct ElasticAuditor {
    client: Client,
}

impl ElasticAuditor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PlanAuditor for ElasticAuditor {
    async fn register_task(
        &self,
        host: &str,
        index: &str,
        label: &str,
        job: Option<JobHandle>,
    ) -> Result<(), MigrationError> {
        let id = job.map(|j| j.id()).unwrap_or_else(Uuid::new_v4).to_string();
        let document = TaskDocument {
            id: id.clone(),
            name: label,
            timestamp: Utc::now().to_rfc3339(),
            status: "pending",
            progress: 0,
            kind: "migration",
            task_id: job.map(|j| j.to_string()),
        };

        let url = format!("{}/{}/_doc/{}", host.trim_end_matches('/'), index, id);
        let response = self.client.put(&url).json(&document).send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(MigrationError::Cluster {
                operation: format!("register task '{}'", label),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        debug!(index, label, id = %id, "Registered task");
        Ok(())
    }
}

/// Auditor that records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditor;

#[async_trait]
impl PlanAuditor for NoopAuditor {
    async fn register_task(
        &self,
        _host: &str,
        _index: &str,
        _label: &str,
        _job: Option<JobHandle>,
    ) -> Result<(), MigrationError> {
        Ok(())
    }
}

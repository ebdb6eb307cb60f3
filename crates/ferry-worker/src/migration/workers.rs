//! Built-in migration workers

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::registry::{MigrationWorker, StepContext};
use super::schema::MigrationSchema;
use crate::error::MigrationError;

/// Copies one index into another with the `_reindex` API
#[derive(Debug, Clone)]
pub struct ReindexWorker {
    client: Client,
    with_script: bool,
}

#[derive(Debug, Deserialize)]
struct ReindexResponse {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    created: u64,
    #[serde(default)]
    updated: u64,
    #[serde(default)]
    failures: Vec<Value>,
}

impl ReindexWorker {
    pub fn new(client: Client, with_script: bool) -> Self {
        Self {
            client,
            with_script,
        }
    }

    fn request_body(&self, schema: &MigrationSchema) -> Result<Value, MigrationError> {
        let copy = &schema.copy_index;
        let mut body = json!({
            "source": { "index": copy.from_index },
            "dest": { "index": copy.to_index }
        });

        if self.with_script {
            let source = copy.script.as_deref().ok_or_else(|| {
                MigrationError::Configuration(format!(
                    "migration step '{}' needs copy_index.script",
                    schema.name
                ))
            })?;
            body["script"] = json!({ "lang": "painless", "source": source });
        }

        Ok(body)
    }
}

#[async_trait]
impl MigrationWorker for ReindexWorker {
    async fn run(
        &self,
        ctx: &StepContext,
        schema: &MigrationSchema,
        elastic_host: &str,
        task_index: &str,
    ) -> Result<(), MigrationError> {
        let body = self.request_body(schema)?;
        let copy = &schema.copy_index;
        let label = format!("Migration of {} to {}", copy.from_index, copy.to_index);

        ctx.progress.update(0, Some(1));
        if let Err(e) = ctx
            .auditor
            .register_task(elastic_host, task_index, &label, ctx.progress.job())
            .await
        {
            warn!(step = %schema.name, error = %e, "Could not register migration task");
        }

        let url = format!("{}/_reindex", elastic_host.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .query(&[("wait_for_completion", "true")])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MigrationError::Cluster {
                operation: label,
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let outcome: ReindexResponse = response.json().await?;
        if !outcome.failures.is_empty() {
            return Err(MigrationError::StepExecution(format!(
                "{}: {} document failures, first: {}",
                label,
                outcome.failures.len(),
                outcome.failures[0]
            )));
        }

        info!(
            step = %schema.name,
            total = outcome.total,
            created = outcome.created,
            updated = outcome.updated,
            "{}", label
        );
        ctx.progress.update(1, Some(1));
        Ok(())
    }
}

//! Batch delivery to the receiving API

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::warn;

use super::importer::Batch;
use crate::config::DeliveryConfig;
use crate::error::DeliveryError;

/// Sends one batch to a destination URL
#[async_trait]
pub trait BatchDeliverer: Send + Sync {
    async fn deliver(&self, url: &str, batch: &Batch) -> Result<(), DeliveryError>;
}

/// POSTs batches as JSON arrays.
///
/// Retries are bounded by [`DeliveryConfig::retries`] with a fixed backoff;
/// with the default of zero retries every batch gets exactly one attempt.
/// Only transport errors and 5xx/429 answers are retried.
#[derive(Debug, Clone)]
pub struct HttpBatchDeliverer {
    client: Client,
    retries: u32,
    backoff: Duration,
}

impl HttpBatchDeliverer {
    pub fn new(client: Client, config: &DeliveryConfig) -> Self {
        Self {
            client,
            retries: config.retries,
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    async fn attempt(&self, url: &str, batch: &Batch) -> Result<(), DeliveryError> {
        let response = self.client.post(url).json(batch).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl BatchDeliverer for HttpBatchDeliverer {
    async fn deliver(&self, url: &str, batch: &Batch) -> Result<(), DeliveryError> {
        let mut attempt = 0;
        loop {
            match self.attempt(url, batch).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    warn!(url, attempt, error = %e, "Batch delivery failed, retrying");
                    tokio::time::sleep(self.backoff).await;
                },
                Err(e) => return Err(e),
            }
        }
    }
}

//! Search cluster importer
//!
//! Reads an index with the scroll API: one search request opens the scroll,
//! follow-up requests page through it with the returned scroll id. Each hit's
//! `_source` becomes a record.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use ferry_common::types::NamedEntity;

use super::config::ElasticCredentials;
use super::importer::{Batch, ImportProgress, Importer};
use crate::error::{WorkerError, WorkerResult};

const IMPORTER_NAME: &str = "elastic";

fn default_batch() -> u32 {
    super::mysql::DEFAULT_BATCH_SIZE
}

/// `config` section of a search import
#[derive(Debug, Clone, Deserialize)]
pub struct ElasticImporterConfig {
    pub index: NamedEntity,
    #[serde(default = "default_batch")]
    pub batch: u32,
}

impl ElasticImporterConfig {
    pub fn validate(&self) -> WorkerResult<()> {
        if self.batch == 0 {
            return Err(WorkerError::Configuration(
                "batch size must be greater than 0".to_string(),
            ));
        }
        self.index.validate()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ScrollResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: Hits,
}

#[derive(Debug, Deserialize)]
struct Hits {
    #[serde(default)]
    total: Option<HitsTotal>,
    #[serde(default)]
    hits: Vec<Hit>,
}

/// Older clusters report a bare number, newer ones an object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HitsTotal {
    Count(u64),
    Relation {
        value: u64,
        #[serde(default)]
        relation: Option<String>,
    },
}

impl HitsTotal {
    fn value(&self) -> u64 {
        match self {
            HitsTotal::Count(n) => *n,
            HitsTotal::Relation { value, .. } => *value,
        }
    }

    /// `gte` means the cluster stopped counting at `value`
    fn is_lower_bound(&self) -> bool {
        matches!(self, HitsTotal::Relation { relation: Some(r), .. } if r == "gte")
    }
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_source", default)]
    source: Value,
}

/// Pages through one index
pub struct ElasticImporter {
    client: Client,
    credentials: ElasticCredentials,
    index: String,
    batch: u32,
    keepalive: String,
    scroll_id: Option<String>,
    read: u64,
    total: Option<u64>,
    done: bool,
}

impl ElasticImporter {
    pub fn new(
        client: Client,
        credentials: ElasticCredentials,
        config: ElasticImporterConfig,
        keepalive: impl Into<String>,
    ) -> WorkerResult<Self> {
        config.validate()?;
        Ok(Self {
            client,
            credentials,
            index: config.index.id,
            batch: config.batch,
            keepalive: keepalive.into(),
            scroll_id: None,
            read: 0,
            total: None,
            done: false,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credentials.username {
            Some(ref username) => request.basic_auth(username, self.credentials.password.as_ref()),
            None => request,
        }
    }

    fn request(&self) -> RequestBuilder {
        let endpoint = self.credentials.endpoint();
        let request = match self.scroll_id {
            None => self
                .client
                .post(format!("{}/{}/_search", endpoint, self.index))
                .query(&[("scroll", self.keepalive.as_str())])
                .json(&json!({ "size": self.batch, "sort": ["_doc"], "track_total_hits": true })),
            Some(ref scroll_id) => self
                .client
                .post(format!("{}/_search/scroll", endpoint))
                .json(&json!({ "scroll": self.keepalive, "scroll_id": scroll_id })),
        };
        self.authorize(request)
    }

    async fn fetch(&self) -> WorkerResult<ScrollResponse> {
        let response = self.request().send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::importer(
                IMPORTER_NAME,
                format!("index '{}' returned {}: {}", self.index, status, body),
            ));
        }

        response
            .json::<ScrollResponse>()
            .await
            .map_err(|e| WorkerError::importer(IMPORTER_NAME, format!("malformed search response: {}", e)))
    }

    /// Release the server-side scroll context, best effort
    async fn clear_scroll(&mut self) {
        let Some(scroll_id) = self.scroll_id.take() else {
            return;
        };

        let request = self
            .client
            .delete(format!("{}/_search/scroll", self.credentials.endpoint()))
            .json(&json!({ "scroll_id": scroll_id }));

        if let Err(e) = self.authorize(request).send().await {
            warn!(index = %self.index, error = %e, "Failed to clear scroll");
        }
    }
}

#[async_trait]
impl Importer for ElasticImporter {
    fn name(&self) -> &str {
        IMPORTER_NAME
    }

    async fn next_batch(&mut self) -> WorkerResult<Option<(ImportProgress, Batch)>> {
        if self.done {
            return Ok(None);
        }

        let first_page = self.scroll_id.is_none();
        let page = self.fetch().await?;

        if let Some(hits_total) = page.hits.total.as_ref() {
            let total = hits_total.value();
            if first_page {
                if hits_total.is_lower_bound() {
                    warn!(index = %self.index, total, "Cluster reported a lower bound for the hit count");
                }
                info!(index = %self.index, total, "Opened scroll");
            }
            self.total.get_or_insert(total);
        }
        if page.scroll_id.is_some() {
            self.scroll_id = page.scroll_id;
        }

        if page.hits.hits.is_empty() {
            self.done = true;
            self.clear_scroll().await;
            return Ok(None);
        }

        let batch: Batch = page.hits.hits.into_iter().map(|hit| hit.source).collect();
        self.read += batch.len() as u64;

        // A lower-bound or stale count is raised to what has been read
        if let Some(total) = self.total.as_mut() {
            *total = (*total).max(self.read);
        }
        debug!(index = %self.index, read = self.read, "Fetched page");

        Ok(Some((
            ImportProgress {
                current: self.read,
                total: self.total,
            },
            batch,
        )))
    }
}

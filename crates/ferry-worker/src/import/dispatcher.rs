//! Import dispatcher
//!
//! Pulls batches from an [`Importer`], delivers each one to the receiving API
//! and republishes the importer's progress. Delivery is best effort: a failed
//! batch is logged and counted, and the run moves on to the next one.

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::config::ImportConfig;
use super::deliverer::BatchDeliverer;
use super::importer::{Batch, ImportProgress, Importer};
use crate::error::{WorkerError, WorkerResult};
use crate::progress::ProgressTracker;

/// Combines an importer with a batch deliverer
pub struct ImportDispatcher<I, D> {
    importer: I,
    deliverer: D,
    webhook_path: String,
}

impl<I: Importer, D: BatchDeliverer> ImportDispatcher<I, D> {
    pub fn new(importer: I, deliverer: D, config: &ImportConfig) -> Self {
        Self {
            importer,
            deliverer,
            webhook_path: config.webhook_path(),
        }
    }

    pub fn webhook_path(&self) -> &str {
        &self.webhook_path
    }

    /// Start a run that delivers to `api_url`.
    ///
    /// Nothing is read until the returned [`ImportRun`] is polled.
    pub fn run(self, api_url: &str) -> ImportRun<I, D> {
        let destination = format!("{}{}", api_url.trim_end_matches('/'), self.webhook_path);
        ImportRun {
            importer: self.importer,
            deliverer: self.deliverer,
            destination,
            summary: ImportSummary::default(),
        }
    }
}

/// One batch after its delivery attempt
#[derive(Debug, Clone)]
pub struct DispatchedBatch {
    pub progress: ImportProgress,
    pub batch: Batch,
    pub delivered: bool,
}

/// Counters for a finished or in-flight run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub batches: u64,
    pub records: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Lazy sequence of dispatched batches
pub struct ImportRun<I, D> {
    importer: I,
    deliverer: D,
    destination: String,
    summary: ImportSummary,
}

impl<I: Importer, D: BatchDeliverer> ImportRun<I, D> {
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn summary(&self) -> ImportSummary {
        self.summary
    }

    /// Read, deliver and return the next batch.
    ///
    /// Importer errors end the run; delivery errors do not.
    pub async fn next(&mut self) -> WorkerResult<Option<DispatchedBatch>> {
        let Some((progress, batch)) = self.importer.next_batch().await? else {
            return Ok(None);
        };

        self.summary.batches += 1;
        self.summary.records += batch.len() as u64;

        let delivered = match self.deliverer.deliver(&self.destination, &batch).await {
            Ok(()) => {
                self.summary.delivered += 1;
                debug!(
                    importer = self.importer.name(),
                    records = batch.len(),
                    current = progress.current,
                    "Batch delivered"
                );
                true
            },
            Err(e) => {
                self.summary.failed += 1;
                error!(
                    importer = self.importer.name(),
                    destination = %self.destination,
                    records = batch.len(),
                    error = %e,
                    "Batch delivery failed"
                );
                false
            },
        };

        Ok(Some(DispatchedBatch {
            progress,
            batch,
            delivered,
        }))
    }

    /// Drive the run to the end, reporting progress once per batch
    pub async fn drain(mut self, progress: &ProgressTracker) -> WorkerResult<ImportSummary> {
        while let Some(dispatched) = self.next().await? {
            progress.update(dispatched.progress.current, dispatched.progress.total);
        }

        info!(
            importer = self.importer.name(),
            batches = self.summary.batches,
            records = self.summary.records,
            failed = self.summary.failed,
            "Import finished"
        );
        Ok(self.summary)
    }

    /// Expose the run as a `Stream`
    pub fn into_stream(self) -> impl Stream<Item = WorkerResult<DispatchedBatch>> {
        stream::try_unfold(self, |mut run| async move {
            let next = run.next().await?;
            Ok::<_, WorkerError>(next.map(|dispatched| (dispatched, run)))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use crate::progress::{JobHandle, ProgressReporter};
    use async_trait::async_trait;
    use futures::TryStreamExt;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct VecImporter {
        batches: VecDeque<Batch>,
        total: u64,
        read: u64,
        fail_after: Option<u64>,
    }

    impl VecImporter {
        fn new(batches: Vec<Batch>) -> Self {
            let total = batches.iter().map(|b| b.len() as u64).sum();
            Self {
                batches: batches.into(),
                total,
                read: 0,
                fail_after: None,
            }
        }
    }

    #[async_trait]
    impl Importer for VecImporter {
        fn name(&self) -> &str {
            "vec"
        }

        async fn next_batch(&mut self) -> WorkerResult<Option<(ImportProgress, Batch)>> {
            if self.fail_after == Some(self.read) {
                return Err(WorkerError::importer("vec", "source went away"));
            }
            Ok(self.batches.pop_front().map(|batch| {
                self.read += batch.len() as u64;
                (
                    ImportProgress {
                        current: self.read,
                        total: Some(self.total),
                    },
                    batch,
                )
            }))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingDeliverer {
        seen: Arc<Mutex<Vec<(String, Batch)>>>,
        reject: Option<usize>,
    }

    #[async_trait]
    impl BatchDeliverer for RecordingDeliverer {
        async fn deliver(&self, url: &str, batch: &Batch) -> Result<(), DeliveryError> {
            let mut seen = self.seen.lock().unwrap();
            seen.push((url.to_string(), batch.clone()));
            if self.reject == Some(seen.len()) {
                return Err(DeliveryError::Rejected {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Updates(Mutex<Vec<(u64, Option<u64>)>>);

    impl ProgressReporter for Updates {
        fn update(&self, _job: JobHandle, current: u64, total: Option<u64>) {
            self.0.lock().unwrap().push((current, total));
        }
    }

    fn import_config() -> ImportConfig {
        ImportConfig::from_payload(json!({
            "name": "test",
            "api_url": "http://localhost:8686/",
            "event_source": { "id": "@test-source", "name": "test" },
            "event_type": "import"
        }))
        .unwrap()
    }

    fn batches() -> Vec<Batch> {
        vec![
            vec![json!({ "n": 1 }), json!({ "n": 2 })],
            vec![json!({ "n": 3 }), json!({ "n": 4 })],
            vec![json!({ "n": 5 })],
        ]
    }

    #[tokio::test]
    async fn test_batches_delivered_in_order_with_one_update_each() {
        let deliverer = RecordingDeliverer::default();
        let updates = Arc::new(Updates::default());
        let tracker = ProgressTracker::bound(JobHandle::new(), updates.clone());

        let config = import_config();
        let summary = ImportDispatcher::new(VecImporter::new(batches()), deliverer.clone(), &config)
            .run(&config.api_url)
            .drain(&tracker)
            .await
            .unwrap();

        let seen = deliverer.seen.lock().unwrap().clone();
        let delivered: Vec<Batch> = seen.iter().map(|(_, b)| b.clone()).collect();
        assert_eq!(delivered, batches());
        assert!(seen
            .iter()
            .all(|(url, _)| url == "http://localhost:8686/collect/import/@test-source"));

        assert_eq!(
            updates.0.lock().unwrap().clone(),
            vec![(2, Some(5)), (4, Some(5)), (5, Some(5))]
        );
        assert_eq!(
            summary,
            ImportSummary {
                batches: 3,
                records: 5,
                delivered: 3,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_delivery_failure_does_not_stop_the_run() {
        let deliverer = RecordingDeliverer {
            reject: Some(2),
            ..Default::default()
        };
        let updates = Arc::new(Updates::default());
        let tracker = ProgressTracker::bound(JobHandle::new(), updates.clone());

        let config = import_config();
        let summary = ImportDispatcher::new(VecImporter::new(batches()), deliverer.clone(), &config)
            .run(&config.api_url)
            .drain(&tracker)
            .await
            .unwrap();

        assert_eq!(summary.delivered, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(deliverer.seen.lock().unwrap().len(), 3);
        assert_eq!(updates.0.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_importer_error_ends_the_run() {
        let mut importer = VecImporter::new(batches());
        importer.fail_after = Some(4);

        let config = import_config();
        let result = ImportDispatcher::new(importer, RecordingDeliverer::default(), &config)
            .run(&config.api_url)
            .drain(&ProgressTracker::detached())
            .await;

        assert!(matches!(result, Err(WorkerError::Importer { .. })));
    }

    #[tokio::test]
    async fn test_run_is_lazy_and_streams() {
        let deliverer = RecordingDeliverer::default();
        let config = import_config();
        let run = ImportDispatcher::new(VecImporter::new(batches()), deliverer.clone(), &config)
            .run(&config.api_url);

        assert!(deliverer.seen.lock().unwrap().is_empty());

        let dispatched: Vec<DispatchedBatch> = run.into_stream().try_collect().await.unwrap();
        let progress: Vec<u64> = dispatched.iter().map(|d| d.progress.current).collect();
        assert_eq!(progress, vec![2, 4, 5]);
        assert!(dispatched.iter().all(|d| d.delivered));
    }

    #[tokio::test]
    async fn test_empty_source_reports_nothing() {
        let updates = Arc::new(Updates::default());
        let tracker = ProgressTracker::bound(JobHandle::new(), updates.clone());
        let config = import_config();

        let summary = ImportDispatcher::new(VecImporter::new(vec![]), RecordingDeliverer::default(), &config)
            .run(&config.api_url)
            .drain(&tracker)
            .await
            .unwrap();

        assert_eq!(summary, ImportSummary::default());
        assert!(updates.0.lock().unwrap().is_empty());
    }
}

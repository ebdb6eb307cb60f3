//! Importer capability
//!
//! Implement this trait for any data source that can be read in pages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::WorkerResult;

/// One record read from a source
pub type Record = serde_json::Value;

/// A bounded group of records produced by one importer step
pub type Batch = Vec<Record>;

/// How far an importer has read.
///
/// `current` counts records read so far and never decreases. `total` is known
/// for sources that can count up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportProgress {
    pub current: u64,
    pub total: Option<u64>,
}

/// Lazy, finite source of batches
#[async_trait]
pub trait Importer: Send {
    /// Short name used in logs, e.g. "mysql-table"
    fn name(&self) -> &str;

    /// Read the next batch, or `None` once the source is exhausted.
    ///
    /// Implementations hold at most one batch in memory at a time.
    async fn next_batch(&mut self) -> WorkerResult<Option<(ImportProgress, Batch)>>;
}

//! Ferry Worker
//!
//! Moves data from MySQL tables, MySQL queries and search indexes into a
//! receiving API in batches, and orchestrates index migrations made of
//! synchronous and asynchronous steps.
//!
//! # Example
//!
//! ```no_run
//! use ferry_worker::config::WorkerConfig;
//! use ferry_worker::jobs::{run_search_import, WorkerContext};
//! use ferry_worker::progress::ProgressTracker;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = WorkerContext::new(WorkerConfig::load()?)?;
//!     let summary = run_search_import(
//!         &ctx,
//!         &ProgressTracker::detached(),
//!         json!({
//!             "name": "logs",
//!             "api_url": "http://localhost:8686",
//!             "event_source": { "id": "@logs", "name": "Logs" },
//!             "event_type": "import",
//!             "config": { "index": { "id": "tracker-log", "name": "log" }, "batch": 100 }
//!         }),
//!         json!({ "url": "localhost" }),
//!     )
//!     .await?;
//!     println!("{} records", summary.records);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod error;
pub mod import;
pub mod jobs;
pub mod migration;
pub mod progress;

pub use error::{DeliveryError, MigrationError, WorkerError, WorkerResult};

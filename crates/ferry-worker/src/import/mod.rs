//! Import path: read a source in batches and deliver them to the receiving API

pub mod config;
pub mod deliverer;
pub mod dispatcher;
pub mod elastic;
pub mod importer;
pub mod mysql;

pub use config::{ElasticCredentials, ImportConfig, MySqlCredentials};
pub use deliverer::{BatchDeliverer, HttpBatchDeliverer};
pub use dispatcher::{DispatchedBatch, ImportDispatcher, ImportRun, ImportSummary};
pub use elastic::{ElasticImporter, ElasticImporterConfig};
pub use importer::{Batch, ImportProgress, Importer, Record};
pub use mysql::{MySqlQueryConfig, MySqlQueryImporter, MySqlTableConfig, MySqlTableImporter};

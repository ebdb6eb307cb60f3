//! Worker error types
//!
//! Errors are split by where they stop: [`WorkerError`] ends an import run,
//! [`DeliveryError`] is logged per batch and never ends a run, and
//! [`MigrationError`] belongs to a single migration step.

use thiserror::Error;

use ferry_common::FerryError;

/// Result type alias for import and job entry points
pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

/// Errors that abort an import job
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Malformed import payload, detected before any I/O
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The data source failed mid-run
    #[error("Importer '{importer}' failed: {message}")]
    Importer { importer: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

impl From<FerryError> for WorkerError {
    fn from(err: FerryError) -> Self {
        WorkerError::Configuration(err.to_string())
    }
}

impl WorkerError {
    pub fn importer(importer: &str, message: impl Into<String>) -> Self {
        WorkerError::Importer {
            importer: importer.to_string(),
            message: message.into(),
        }
    }
}

/// A single batch failed to reach the receiving API
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Receiving API answered {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl DeliveryError {
    /// Transport failures and server-side rejections may succeed later;
    /// client-side rejections will not
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Rejected { status, .. } => *status >= 500 || *status == 429,
            DeliveryError::Transport(_) => true,
        }
    }
}

/// Errors raised while planning or running a migration step
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("No migration worker defined for name {0}")]
    WorkerNotFound(String),

    #[error("Invalid migration schema: {0}")]
    Configuration(String),

    #[error("Search cluster answered {status} to {operation}: {body}")]
    Cluster {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Step execution failed: {0}")]
    StepExecution(String),
}

impl From<FerryError> for MigrationError {
    fn from(err: FerryError) -> Self {
        MigrationError::Configuration(err.to_string())
    }
}

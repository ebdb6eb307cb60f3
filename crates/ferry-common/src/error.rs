//! Error types shared across Ferry crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, FerryError>;

/// Main error type for shared Ferry types
#[derive(Error, Debug)]
pub enum FerryError {
    #[error("Malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Invalid entity reference: {0}")]
    InvalidEntity(String),
}

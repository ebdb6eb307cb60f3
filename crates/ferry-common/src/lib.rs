//! Ferry Common Library
//!
//! Shared types, logging setup, and error handling for the Ferry workspace.
//!
//! - **Error Handling**: [`FerryError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by `LOG_*` variables
//! - **Types**: value types shared by importers and migrations
//!
//! # Example
//!
//! ```no_run
//! use ferry_common::types::NamedEntity;
//!
//! fn main() -> ferry_common::Result<()> {
//!     let index = NamedEntity::new("tracker-log-2024-5", "log")?;
//!     println!("importing from {}", index);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod types;

pub use error::{FerryError, Result};

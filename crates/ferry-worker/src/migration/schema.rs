//! Migration plan model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use ferry_common::types::decode_payload;

use crate::error::MigrationError;

/// Source and destination of a copy step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyIndex {
    pub from_index: String,
    pub to_index: String,
    /// Painless script applied to each document, for workers that use one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

/// One migration step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationSchema {
    pub name: String,
    /// Registered worker name
    pub worker: String,
    #[serde(default)]
    pub asynchronous: bool,
    pub copy_index: CopyIndex,
    /// Worker-specific fields, passed through untouched
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl MigrationSchema {
    pub fn from_payload(payload: Value) -> Result<Self, MigrationError> {
        let schema: Self = decode_payload(payload)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.name.trim().is_empty() {
            return Err(MigrationError::Configuration(
                "migration step has an empty name".to_string(),
            ));
        }
        if self.worker.trim().is_empty() {
            return Err(MigrationError::Configuration(format!(
                "migration step '{}' names no worker",
                self.name
            )));
        }

        let copy = &self.copy_index;
        if copy.from_index.trim().is_empty() || copy.to_index.trim().is_empty() {
            return Err(MigrationError::Configuration(format!(
                "migration step '{}' needs both from_index and to_index",
                self.name
            )));
        }
        if copy.from_index == copy.to_index {
            return Err(MigrationError::Configuration(format!(
                "migration step '{}' copies '{}' onto itself",
                self.name, copy.from_index
            )));
        }
        Ok(())
    }
}

/// Ordered list of steps.
///
/// Only the relative order of synchronous steps is meaningful.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationPlan {
    steps: Vec<MigrationSchema>,
}

impl MigrationPlan {
    pub fn new(steps: Vec<MigrationSchema>) -> Self {
        Self { steps }
    }

    /// Decode every step, failing on the first malformed one
    pub fn from_payloads(payloads: Vec<Value>) -> Result<Self, MigrationError> {
        let steps = payloads
            .into_iter()
            .enumerate()
            .map(|(position, payload)| {
                MigrationSchema::from_payload(payload).map_err(|e| {
                    MigrationError::Configuration(format!("plan step {}: {}", position, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[MigrationSchema] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

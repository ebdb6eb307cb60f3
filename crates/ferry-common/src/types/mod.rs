//! Common types used across Ferry

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::hash::{Hash, Hasher};

use crate::error::{FerryError, Result};

/// Reference to a logical resource such as an index, a database, or a table.
///
/// Two entities are equal when their ids match; the display name is
/// informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedEntity {
    pub id: String,
    pub name: String,
}

impl NamedEntity {
    /// Create a new entity reference, rejecting an empty id
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let entity = Self {
            id: id.into(),
            name: name.into(),
        };
        entity.validate()?;
        Ok(entity)
    }

    /// Check that the id is usable as a path segment or index name
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(FerryError::InvalidEntity(format!(
                "entity '{}' has an empty id",
                self.name
            )));
        }
        if self.id.contains('/') {
            return Err(FerryError::InvalidEntity(format!(
                "entity id '{}' must not contain '/'",
                self.id
            )));
        }
        Ok(())
    }
}

impl PartialEq for NamedEntity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NamedEntity {}

impl Hash for NamedEntity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for NamedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Decode a plain JSON job payload into a typed value
pub fn decode_payload<T: DeserializeOwned>(payload: serde_json::Value) -> Result<T> {
    Ok(serde_json::from_value(payload)?)
}

// ============================================================================
// Progress
// ============================================================================

/// Progress counter for a single job.
///
/// `total` is fixed by the first update that carries one, `current` never
/// decreases and never exceeds `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressState {
    pub current: u64,
    pub total: Option<u64>,
}

/// How an update was folded into a [`ProgressState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressChange {
    /// The update was applied as given
    Applied,
    /// `current` was above `total` and was clamped to it
    Clamped,
    /// `current` was below the recorded value and was ignored
    Regressed,
}

impl ProgressState {
    pub fn new(total: Option<u64>) -> Self {
        Self { current: 0, total }
    }

    /// Fold an update into the state
    pub fn advance(&mut self, current: u64, total: Option<u64>) -> ProgressChange {
        if self.total.is_none() {
            self.total = total;
        }

        if current < self.current {
            return ProgressChange::Regressed;
        }

        match self.total {
            Some(total) if current > total => {
                self.current = total;
                ProgressChange::Clamped
            },
            _ => {
                self.current = current;
                ProgressChange::Applied
            },
        }
    }

    /// Fraction of work done, when a total is known
    pub fn ratio(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some(self.current as f64 / total as f64),
            None => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.total, Some(total) if self.current >= total)
    }
}

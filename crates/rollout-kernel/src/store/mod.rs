//! Deployment record store
//!
//! A persistent mapping from logical name to [`DeploymentRecord`]. Components
//! receive the store explicitly as `Arc<dyn RecordStore>`; there is no global
//! instance.
//!
//! # Guarantees
//!
//! - `save` is last-writer-wins
//! - `delete` of an absent name succeeds
//! - no validation of `record.address`; that belongs to the change detector
//! - no concurrent-writer arbitration: one orchestration process owns a store

mod json_file;
mod memory;

pub use json_file::JsonFileRecordStore;
pub use memory::MemoryRecordStore;

use crate::types::{DeploymentKind, DeploymentRecord};
use std::path::PathBuf;

/// Record store trait
pub trait RecordStore: Send + Sync {
    /// Fetch the record stored under `name`
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if nothing is stored under `name`.
    fn get(&self, name: &str) -> Result<DeploymentRecord, StoreError> {
        self.get_or_null(name)?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// Fetch the record stored under `name`, if any
    fn get_or_null(&self, name: &str) -> Result<Option<DeploymentRecord>, StoreError>;

    /// Store `record` under `name`, replacing any previous record
    fn save(&self, name: &str, record: &DeploymentRecord) -> Result<(), StoreError>;

    /// Remove the record under `name`; absent names are not an error
    fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// All stored names in ascending order
    fn names(&self) -> Result<Vec<String>, StoreError>;
}

/// Canonical names that currently have a shadow record under `suffix`
///
/// A shadow left in the store marks a migration that has not been promoted
/// yet. Re-running `ensure` for the canonical name settles it.
///
/// Names ending in `suffix` are reserved for shadows. Only `Direct` records
/// whose canonical slot is empty or also `Direct` are reported, since
/// migrations never stage anything else.
pub fn pending_migrations(store: &dyn RecordStore, suffix: &str) -> Result<Vec<String>, StoreError> {
    if suffix.is_empty() {
        return Ok(Vec::new());
    }
    let mut pending = Vec::new();
    for name in store.names()? {
        let Some(canonical) = name.strip_suffix(suffix).filter(|c| !c.is_empty()) else {
            continue;
        };
        let Some(shadow) = store.get_or_null(&name)? else {
            continue;
        };
        let canonical_is_direct = store
            .get_or_null(canonical)?
            .map_or(true, |record| record.kind == DeploymentKind::Direct);
        if shadow.kind == DeploymentKind::Direct && canonical_is_direct {
            pending.push(canonical.to_string());
        }
    }
    Ok(pending)
}

/// Record store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no record stored under '{0}'")]
    NotFound(String),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid record name '{0}'")]
    InvalidName(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

//! In-memory record store

use super::{RecordStore, StoreError};
use crate::types::DeploymentRecord;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Record store backed by a map; contents are lost on drop
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<String, DeploymentRecord>>,
}

impl MemoryRecordStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Check if the store holds no records
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Copy of every stored record, keyed by name
    pub fn snapshot(&self) -> BTreeMap<String, DeploymentRecord> {
        self.records.read().clone()
    }
}

impl RecordStore for MemoryRecordStore {
    fn get_or_null(&self, name: &str) -> Result<Option<DeploymentRecord>, StoreError> {
        Ok(self.records.read().get(name).cloned())
    }

    fn save(&self, name: &str, record: &DeploymentRecord) -> Result<(), StoreError> {
        self.records.write().insert(name.to_string(), record.clone());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.records.write().remove(name);
        Ok(())
    }

    fn names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.records.read().keys().cloned().collect())
    }
}

//! Action journal
//!
//! Append-only record of every mutating action the engine performs. Each
//! entry is chained to its predecessor with a SHA-256 hash so that edits to
//! the history are detectable.

use crate::types::Address;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rollout_artifact::Fingerprint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Kind of mutation recorded in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalAction {
    Deploy,
    Upgrade,
    StageShadow,
    Promote,
    Rollback,
    Adopt,
    SettleShadow,
}

impl JournalAction {
    fn as_str(self) -> &'static str {
        match self {
            JournalAction::Deploy => "deploy",
            JournalAction::Upgrade => "upgrade",
            JournalAction::StageShadow => "stage_shadow",
            JournalAction::Promote => "promote",
            JournalAction::Rollback => "rollback",
            JournalAction::Adopt => "adopt",
            JournalAction::SettleShadow => "settle_shadow",
        }
    }
}

impl fmt::Display for JournalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub action: JournalAction,
    pub name: String,
    pub address: Option<Address>,
    pub fingerprint: Option<Fingerprint>,
    pub prev_hash: [u8; 32],
    pub hash: [u8; 32],
}

/// Hash-chained, append-only action journal
#[derive(Debug, Default)]
pub struct ActionJournal {
    inner: Mutex<Vec<JournalEntry>>,
}

impl ActionJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action and return its sequence number
    pub fn record(
        &self,
        action: JournalAction,
        name: &str,
        address: Option<&Address>,
        fingerprint: Option<Fingerprint>,
    ) -> u64 {
        let mut guard = self.inner.lock();
        let prev_hash = guard.last().map_or([0u8; 32], |e| e.hash);
        let mut entry = JournalEntry {
            seq: guard.len() as u64,
            timestamp: Utc::now(),
            action,
            name: name.to_string(),
            address: address.cloned(),
            fingerprint,
            prev_hash,
            hash: [0u8; 32],
        };
        entry.hash = compute_hash(&entry);
        let seq = entry.seq;
        guard.push(entry);
        seq
    }

    /// Copy of all entries in append order
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.inner.lock().clone()
    }

    /// Actions recorded for `name`, in order
    pub fn actions_for(&self, name: &str) -> Vec<JournalAction> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .map(|e| e.action)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Check every link of the hash chain
    ///
    /// # Errors
    /// [`JournalError::IntegrityViolation`] naming the first broken entry.
    pub fn verify_integrity(&self) -> Result<(), JournalError> {
        let guard = self.inner.lock();
        let mut prev = [0u8; 32];
        for e in guard.iter() {
            if e.prev_hash != prev || e.hash != compute_hash(e) {
                return Err(JournalError::IntegrityViolation { seq: e.seq });
            }
            prev = e.hash;
        }
        Ok(())
    }

    #[cfg(test)]
    fn tamper<F: FnOnce(&mut JournalEntry)>(&self, seq: usize, f: F) {
        f(&mut self.inner.lock()[seq]);
    }
}

fn compute_hash(entry: &JournalEntry) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(entry.seq.to_le_bytes());
    hasher.update(entry.timestamp.timestamp_micros().to_le_bytes());
    hasher.update(entry.action.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(entry.name.as_bytes());
    hasher.update([0]);
    if let Some(address) = &entry.address {
        hasher.update(address.as_str().as_bytes());
    }
    hasher.update([0]);
    if let Some(fp) = &entry.fingerprint {
        hasher.update(fp.as_bytes());
    }
    hasher.update(entry.prev_hash);
    hasher.finalize().into()
}

/// Journal errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JournalError {
    #[error("journal hash chain broken at entry {seq}")]
    IntegrityViolation { seq: u64 },
}

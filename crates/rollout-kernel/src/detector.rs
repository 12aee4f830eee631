//! Change detector
//!
//! Classifies a target by comparing the fingerprint of the code actually
//! installed at its recorded address with the fingerprint of the latest
//! build. Installed code is always read from the remote environment; the
//! fingerprint cached in the record is never trusted for the verdict.

use crate::error::DeployError;
use crate::remote::RemoteEnvironment;
use crate::retry::{with_retry, RetryPolicy};
use crate::store::RecordStore;
use crate::types::{Address, DeploymentRecord};
use rollout_artifact::{Fingerprint, ResolvedArtifact};
use std::fmt;
use std::sync::Arc;

/// Why a target counts as absent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbsentReason {
    /// Nothing is stored under the name
    NoRecord,
    /// A record exists but no code is installed at its address
    CodeVanished { previous: DeploymentRecord },
}

/// Verdict for a single target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Needs a fresh deployment
    Absent(AbsentReason),
    /// Installed code matches the latest build
    UpToDate(DeploymentRecord),
    /// Installed code differs from the latest build
    NeedsUpgrade {
        record: DeploymentRecord,
        installed: Fingerprint,
        latest: Fingerprint,
    },
    /// Externally supplied reference; never touched
    ForeignRecord(DeploymentRecord),
}

impl Classification {
    /// Stored record the verdict was based on, if any
    pub fn record(&self) -> Option<&DeploymentRecord> {
        match self {
            Classification::Absent(AbsentReason::NoRecord) => None,
            Classification::Absent(AbsentReason::CodeVanished { previous }) => Some(previous),
            Classification::UpToDate(record)
            | Classification::NeedsUpgrade { record, .. }
            | Classification::ForeignRecord(record) => Some(record),
        }
    }

    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Classification::Absent(_))
    }

    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, Classification::UpToDate(_))
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Absent(AbsentReason::NoRecord) => f.write_str("absent"),
            Classification::Absent(AbsentReason::CodeVanished { .. }) => {
                f.write_str("absent (code vanished)")
            }
            Classification::UpToDate(_) => f.write_str("up to date"),
            Classification::NeedsUpgrade { .. } => f.write_str("needs upgrade"),
            Classification::ForeignRecord(_) => f.write_str("foreign record"),
        }
    }
}

/// Classifies targets against the record store and remote environment
#[derive(Clone)]
pub struct ChangeDetector {
    store: Arc<dyn RecordStore>,
    remote: Arc<dyn RemoteEnvironment>,
    retry: RetryPolicy,
}

impl fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeDetector")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn RecordStore>, remote: Arc<dyn RemoteEnvironment>) -> Self {
        Self {
            store,
            remote,
            retry: RetryPolicy::default(),
        }
    }

    /// Use `policy` for remote reads
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Classify the target stored under `name` against `latest`
    ///
    /// # Errors
    /// Store failures, or [`DeployError::RetryExhausted`] when the remote
    /// environment cannot be read.
    pub async fn classify(
        &self,
        name: &str,
        latest: &ResolvedArtifact,
    ) -> Result<Classification, DeployError> {
        let Some(record) = self.store.get_or_null(name)? else {
            tracing::debug!(name, "no record stored");
            return Ok(Classification::Absent(AbsentReason::NoRecord));
        };

        if record.is_external() {
            tracing::debug!(name, address = %record.address, "external record");
            return Ok(Classification::ForeignRecord(record));
        }

        let Some(code) = self.installed_code(&record).await? else {
            return Ok(Classification::Absent(AbsentReason::CodeVanished { previous: record }));
        };

        let installed = Fingerprint::of_code(&code);
        let verdict = match latest.fingerprint {
            Some(latest) if latest != installed => Classification::NeedsUpgrade {
                record,
                installed,
                latest,
            },
            _ => Classification::UpToDate(record),
        };
        tracing::debug!(name, installed = %installed.short(), %verdict, "classified");
        Ok(verdict)
    }

    /// Runtime code behind `record`, or `None` when nothing is installed
    ///
    /// Proxy and beacon records are checked at their own address first so a
    /// wiped network reads as vanished code rather than a failed
    /// implementation lookup.
    async fn installed_code(&self, record: &DeploymentRecord) -> Result<Option<Vec<u8>>, DeployError> {
        let name = record.name.as_str();
        let own = self.read_code(name, &record.address).await?;
        if own.is_empty() {
            tracing::debug!(name, address = %record.address, "recorded address has no code");
            return Ok(None);
        }
        if !record.kind.is_upgradeable_in_place() {
            return Ok(Some(own));
        }

        let implementation = with_retry(
            &self.retry,
            &format!("read implementation of {name}"),
            || self.remote.read_implementation_address(&record.address),
        )
        .await?;
        let code = self.read_code(name, &implementation).await?;
        if code.is_empty() {
            tracing::debug!(name, %implementation, "implementation has no code");
            return Ok(None);
        }
        Ok(Some(code))
    }

    async fn read_code(&self, name: &str, address: &Address) -> Result<Vec<u8>, DeployError> {
        with_retry(&self.retry, &format!("read code of {name}"), || {
            self.remote.read_installed_code(address)
        })
        .await
    }
}

//! Migration/swap protocol
//!
//! Replaces a `Direct` target that cannot be upgraded in place. The new
//! instance is staged under a shadow name and then promoted into the
//! canonical slot.
//!
//! # Re-entrancy
//!
//! Every step can be interrupted and re-run:
//! - a shadow whose installed code already matches the latest build is reused
//! - a failed promote restores the previous canonical record and leaves the
//!   shadow in place, so the next run promotes it again
//!
//! After a successful promote exactly one record exists under the canonical
//! name and none under the shadow name.

use crate::detector::{ChangeDetector, Classification};
use crate::engine::deploy_record;
use crate::error::DeployError;
use crate::journal::{ActionJournal, JournalAction};
use crate::remote::RemoteEnvironment;
use crate::retry::RetryPolicy;
use crate::store::{RecordStore, StoreError};
use crate::types::{DeploymentKind, DeploymentRecord};
use rollout_artifact::ResolvedArtifact;
use std::fmt;
use std::sync::Arc;

/// Suffix appended to a canonical name to form its shadow name
pub const DEFAULT_SHADOW_SUFFIX: &str = "_NEW";

/// Shadow name for `name`
#[inline]
#[must_use]
pub fn shadow_name(name: &str, suffix: &str) -> String {
    format!("{name}{suffix}")
}

/// Sub-step of promote that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromotePhase {
    ReadShadow,
    CaptureCanonical,
    DeleteCanonical,
    SaveCanonical,
    DeleteShadow,
}

impl fmt::Display for PromotePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PromotePhase::ReadShadow => "reading the shadow record",
            PromotePhase::CaptureCanonical => "reading the canonical record",
            PromotePhase::DeleteCanonical => "deleting the canonical record",
            PromotePhase::SaveCanonical => "saving the promoted record",
            PromotePhase::DeleteShadow => "deleting the shadow record",
        };
        f.write_str(s)
    }
}

/// Stages and promotes replacement instances for `Direct` targets
#[derive(Clone)]
pub struct SwapProtocol {
    store: Arc<dyn RecordStore>,
    remote: Arc<dyn RemoteEnvironment>,
    journal: Arc<ActionJournal>,
    retry: RetryPolicy,
    suffix: String,
}

impl fmt::Debug for SwapProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwapProtocol")
            .field("suffix", &self.suffix)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl SwapProtocol {
    pub fn new(
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteEnvironment>,
        journal: Arc<ActionJournal>,
    ) -> Self {
        Self {
            store,
            remote,
            journal,
            retry: RetryPolicy::default(),
            suffix: DEFAULT_SHADOW_SUFFIX.to_string(),
        }
    }

    #[must_use]
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Shadow name used for `name`
    pub fn shadow_name(&self, name: &str) -> String {
        shadow_name(name, &self.suffix)
    }

    /// Check if a shadow record is waiting to be promoted for `name`
    ///
    /// Only `Direct` records count as shadows.
    pub fn has_pending(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get_or_null(&self.shadow_name(name))?
            .is_some_and(|shadow| shadow.kind == DeploymentKind::Direct))
    }

    /// Replace the instance behind `name` with a fresh deployment of `latest`
    ///
    /// Reuses a shadow that already runs the latest build instead of
    /// deploying again.
    ///
    /// # Errors
    /// - [`DeployError::RetryExhausted`] if staging the shadow fails
    /// - [`DeployError::MigrationFailed`] if promote fails
    pub async fn migrate(
        &self,
        name: &str,
        latest: &ResolvedArtifact,
        args: &[serde_json::Value],
    ) -> Result<DeploymentRecord, DeployError> {
        let shadow = self.shadow_name(name);
        let detector = ChangeDetector::new(self.store.clone(), self.remote.clone())
            .with_retry_policy(self.retry);

        match detector.classify(&shadow, latest).await? {
            Classification::UpToDate(staged) => {
                tracing::info!(name, shadow, address = %staged.address, "resuming staged migration");
            }
            other => {
                if let Some(stale) = other.record() {
                    tracing::warn!(name, shadow, address = %stale.address, "discarding stale shadow");
                }
                let staged = deploy_record(
                    self.remote.as_ref(),
                    &self.retry,
                    &shadow,
                    latest,
                    DeploymentKind::Direct,
                    args,
                )
                .await?;
                self.store.save(&shadow, &staged)?;
                self.journal.record(
                    JournalAction::StageShadow,
                    &shadow,
                    Some(&staged.address),
                    staged.code_fingerprint,
                );
                tracing::info!(name, shadow, address = %staged.address, "staged replacement");
            }
        }

        self.promote(name)
    }

    /// Move the shadow record for `name` into the canonical slot
    ///
    /// On failure the previous canonical record is restored best-effort and
    /// the shadow is left in place.
    ///
    /// # Errors
    /// [`DeployError::MigrationFailed`] naming the failed phase.
    pub fn promote(&self, name: &str) -> Result<DeploymentRecord, DeployError> {
        let shadow = self.shadow_name(name);
        let fail = |phase: PromotePhase, source: StoreError| DeployError::MigrationFailed {
            name: name.to_string(),
            phase,
            source: Box::new(source.into()),
        };

        let staged = self
            .store
            .get(&shadow)
            .map_err(|e| fail(PromotePhase::ReadShadow, e))?;
        let previous = self
            .store
            .get_or_null(name)
            .map_err(|e| fail(PromotePhase::CaptureCanonical, e))?;
        let promoted = staged.renamed(name);

        if let Err((phase, source)) = self.swap(name, &shadow, &promoted) {
            tracing::warn!(name, %phase, error = %source, "promote failed, rolling back");
            self.rollback(name, previous.as_ref());
            return Err(fail(phase, source));
        }

        self.journal.record(
            JournalAction::Promote,
            name,
            Some(&promoted.address),
            promoted.code_fingerprint,
        );
        tracing::info!(
            name,
            address = %promoted.address,
            previous = ?previous.as_ref().map(|r| &r.address),
            "promoted replacement"
        );
        Ok(promoted)
    }

    fn swap(
        &self,
        name: &str,
        shadow: &str,
        promoted: &DeploymentRecord,
    ) -> Result<(), (PromotePhase, StoreError)> {
        self.store
            .delete(name)
            .map_err(|e| (PromotePhase::DeleteCanonical, e))?;
        self.store
            .save(name, promoted)
            .map_err(|e| (PromotePhase::SaveCanonical, e))?;
        self.store
            .delete(shadow)
            .map_err(|e| (PromotePhase::DeleteShadow, e))
    }

    fn rollback(&self, name: &str, previous: Option<&DeploymentRecord>) {
        let restored = match previous {
            Some(record) => self.store.save(name, record),
            None => self.store.delete(name),
        };
        match restored {
            Ok(()) => {
                self.journal.record(
                    JournalAction::Rollback,
                    name,
                    previous.map(|r| &r.address),
                    previous.and_then(|r| r.code_fingerprint),
                );
                tracing::warn!(name, "restored previous canonical record");
            }
            Err(error) => {
                tracing::error!(name, %error, "rollback failed; canonical record may be missing");
            }
        }
    }
}

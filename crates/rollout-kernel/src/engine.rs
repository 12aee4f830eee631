//! Idempotent deploy/upgrade engine
//!
//! [`DeployEngine::ensure`] brings one target to the latest build with the
//! minimum remote work. The decision is keyed purely on the classification
//! and the deployment kind:
//!
//! | Classification | Kind            | Action                      |
//! |----------------|-----------------|-----------------------------|
//! | absent         | any owned kind  | deploy fresh                |
//! | up to date     | any owned kind  | no-op                       |
//! | needs upgrade  | proxy / beacon  | upgrade in place            |
//! | needs upgrade  | direct          | migrate through shadow swap |
//! | foreign record | -               | reject                      |
//!
//! Every remote call runs through the retry executor and every mutation is
//! appended to the action journal.

use crate::config::DeployConfig;
use crate::detector::{AbsentReason, ChangeDetector, Classification};
use crate::error::DeployError;
use crate::journal::{ActionJournal, JournalAction};
use crate::migration::{SwapProtocol, DEFAULT_SHADOW_SUFFIX};
use crate::remote::{DeployPayload, RemoteEnvironment, UpgradeOptions};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::RecordStore;
use crate::types::{Address, DeploymentKind, DeploymentRecord, Interface};
use rollout_artifact::{ArtifactResolver, BuildRef, Fingerprint, ResolvedArtifact};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// What to do when a record points at an address with no installed code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleRecordPolicy {
    /// Deploy again and overwrite the stale record
    #[default]
    Redeploy,
    /// Fail with [`DeployError::EnvironmentMismatch`]
    Fail,
}

/// Input to [`DeployEngine::ensure`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureRequest {
    pub name: String,
    pub kind: DeploymentKind,
    pub build: BuildRef,
    pub args: Vec<serde_json::Value>,
    pub upgrade: UpgradeOptions,
}

impl EnsureRequest {
    pub fn new(name: impl Into<String>, kind: DeploymentKind, build: BuildRef) -> Self {
        Self {
            name: name.into(),
            kind,
            build,
            args: Vec::new(),
            upgrade: UpgradeOptions::default(),
        }
    }

    /// Constructor arguments for fresh deployments
    #[must_use]
    pub fn args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    /// Options for in-place upgrades
    #[must_use]
    pub fn upgrade(mut self, options: UpgradeOptions) -> Self {
        self.upgrade = options;
        self
    }
}

/// Remote work performed by a single `ensure`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnsureAction {
    NoOp,
    Deployed,
    Upgraded,
    Migrated,
    Adopted,
}

impl fmt::Display for EnsureAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnsureAction::NoOp => "no-op",
            EnsureAction::Deployed => "deployed",
            EnsureAction::Upgraded => "upgraded",
            EnsureAction::Migrated => "migrated",
            EnsureAction::Adopted => "adopted",
        };
        f.write_str(s)
    }
}

/// Settled record and the action that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ensured {
    pub record: DeploymentRecord,
    pub action: EnsureAction,
}

impl Ensured {
    fn new(record: DeploymentRecord, action: EnsureAction) -> Self {
        Self { record, action }
    }
}

/// Deploy/upgrade engine
pub struct DeployEngine {
    store: Arc<dyn RecordStore>,
    remote: Arc<dyn RemoteEnvironment>,
    resolver: ArtifactResolver,
    journal: Arc<ActionJournal>,
    retry: RetryPolicy,
    shadow_suffix: String,
    stale_records: StaleRecordPolicy,
}

impl fmt::Debug for DeployEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeployEngine")
            .field("retry", &self.retry)
            .field("shadow_suffix", &self.shadow_suffix)
            .field("stale_records", &self.stale_records)
            .finish_non_exhaustive()
    }
}

impl DeployEngine {
    /// Create an engine with default retry, suffix and stale-record policy
    pub fn new(
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteEnvironment>,
        resolver: ArtifactResolver,
    ) -> Self {
        Self {
            store,
            remote,
            resolver,
            journal: Arc::new(ActionJournal::new()),
            retry: RetryPolicy::default(),
            shadow_suffix: DEFAULT_SHADOW_SUFFIX.to_string(),
            stale_records: StaleRecordPolicy::default(),
        }
    }

    /// Create an engine configured from `config`
    pub fn from_config(
        config: &DeployConfig,
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteEnvironment>,
        resolver: ArtifactResolver,
    ) -> Self {
        Self::new(store, remote, resolver)
            .with_retry_policy(config.retry_policy())
            .with_shadow_suffix(config.migration.shadow_suffix.clone())
            .with_stale_record_policy(config.migration.stale_record)
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    #[must_use]
    pub fn with_shadow_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.shadow_suffix = suffix.into();
        self
    }

    #[must_use]
    pub fn with_stale_record_policy(mut self, policy: StaleRecordPolicy) -> Self {
        self.stale_records = policy;
        self
    }

    /// Share an existing journal
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<ActionJournal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn journal(&self) -> &Arc<ActionJournal> {
        &self.journal
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn detector(&self) -> ChangeDetector {
        ChangeDetector::new(self.store.clone(), self.remote.clone()).with_retry_policy(self.retry)
    }

    fn swap(&self) -> SwapProtocol {
        SwapProtocol::new(self.store.clone(), self.remote.clone(), self.journal.clone())
            .with_suffix(self.shadow_suffix.clone())
            .with_retry_policy(self.retry)
    }

    /// Classify `name` against the latest build referenced by `build`
    ///
    /// # Errors
    /// Resolution, store or remote read failures.
    pub async fn classify(&self, name: &str, build: &BuildRef) -> Result<Classification, DeployError> {
        let latest = self.resolver.resolve(name, build)?;
        self.detector().classify(name, &latest).await
    }

    /// Bring the target described by `request` to the latest build
    ///
    /// Running `ensure` again with the same inputs and an unchanged remote
    /// environment performs no remote mutation.
    ///
    /// # Errors
    /// - [`DeployError::ArtifactNotFound`] for unknown catalog references
    /// - [`DeployError::ForeignRecordImmutable`] for external records
    /// - [`DeployError::KindMismatch`] if the stored kind differs
    /// - [`DeployError::EnvironmentMismatch`] for stale records under
    ///   [`StaleRecordPolicy::Fail`]
    /// - [`DeployError::RetryExhausted`] when the remote keeps failing
    /// - [`DeployError::MigrationFailed`] when promote fails
    pub async fn ensure(&self, request: &EnsureRequest) -> Result<Ensured, DeployError> {
        let name = request.name.as_str();
        if request.kind == DeploymentKind::External {
            return Err(DeployError::ForeignRecordImmutable(request.name.clone()));
        }

        let latest = self.resolver.resolve(name, &request.build)?;
        let verdict = self.detector().classify(name, &latest).await?;
        tracing::debug!(name, kind = %request.kind, %verdict, "ensuring target");

        if let Some(record) = verdict.record() {
            if !record.is_external() && record.kind != request.kind {
                return Err(DeployError::KindMismatch {
                    name: request.name.clone(),
                    recorded: record.kind,
                    requested: request.kind,
                });
            }
        }

        let ensured = match verdict {
            Classification::ForeignRecord(_) => {
                return Err(DeployError::ForeignRecordImmutable(request.name.clone()));
            }
            Classification::UpToDate(record) => {
                if request.kind == DeploymentKind::Direct {
                    self.settle_shadow(name)?;
                }
                let record = self.refresh_record(record, &latest).await?;
                Ensured::new(record, EnsureAction::NoOp)
            }
            Classification::Absent(reason) => {
                if let AbsentReason::CodeVanished { previous } = &reason {
                    self.check_stale(previous)?;
                }
                if request.kind == DeploymentKind::Direct && self.swap().has_pending(name)? {
                    let record = self.swap().migrate(name, &latest, &request.args).await?;
                    Ensured::new(record, EnsureAction::Migrated)
                } else {
                    Ensured::new(self.deploy(request, &latest).await?, EnsureAction::Deployed)
                }
            }
            Classification::NeedsUpgrade {
                record,
                installed,
                latest: target,
            } => {
                tracing::info!(
                    name,
                    installed = %installed.short(),
                    latest = %target.short(),
                    "code changed"
                );
                if record.kind.is_upgradeable_in_place() {
                    let upgraded = self.upgrade_in_place(record, request, &latest, target).await?;
                    Ensured::new(upgraded, EnsureAction::Upgraded)
                } else {
                    let record = self.swap().migrate(name, &latest, &request.args).await?;
                    Ensured::new(record, EnsureAction::Migrated)
                }
            }
        };

        tracing::info!(
            name,
            action = %ensured.action,
            address = %ensured.record.address,
            "target settled"
        );
        Ok(ensured)
    }

    /// Record an externally supplied reference under `name`
    ///
    /// Re-adopting the same address is a no-op.
    ///
    /// # Errors
    /// [`DeployError::OwnedRecordConflict`] if `name` holds a record this
    /// process deployed.
    pub fn adopt_external(
        &self,
        name: &str,
        address: Address,
        interface: Interface,
    ) -> Result<Ensured, DeployError> {
        match self.store.get_or_null(name)? {
            Some(existing) if !existing.is_external() => {
                return Err(DeployError::OwnedRecordConflict {
                    name: name.to_string(),
                    address: existing.address,
                });
            }
            Some(existing) if existing.address == address => {
                return Ok(Ensured::new(existing, EnsureAction::NoOp));
            }
            _ => {}
        }

        let record = DeploymentRecord::new(name, address, interface, None, DeploymentKind::External);
        self.store.save(name, &record)?;
        self.journal
            .record(JournalAction::Adopt, name, Some(&record.address), None);
        tracing::info!(name, address = %record.address, "adopted external reference");
        Ok(Ensured::new(record, EnsureAction::Adopted))
    }

    fn check_stale(&self, previous: &DeploymentRecord) -> Result<(), DeployError> {
        match self.stale_records {
            StaleRecordPolicy::Fail => Err(DeployError::EnvironmentMismatch {
                name: previous.name.clone(),
                address: previous.address.clone(),
            }),
            StaleRecordPolicy::Redeploy => {
                tracing::warn!(
                    name = %previous.name,
                    address = %previous.address,
                    "recorded address has no code, redeploying"
                );
                Ok(())
            }
        }
    }

    /// Drop a shadow left behind after its promote already landed
    fn settle_shadow(&self, name: &str) -> Result<(), DeployError> {
        let swap = self.swap();
        if !swap.has_pending(name)? {
            return Ok(());
        }
        let shadow = swap.shadow_name(name);
        self.store.delete(&shadow)?;
        self.journal
            .record(JournalAction::SettleShadow, &shadow, None, None);
        tracing::info!(name, shadow, "removed leftover shadow record");
        Ok(())
    }

    async fn deploy(
        &self,
        request: &EnsureRequest,
        latest: &ResolvedArtifact,
    ) -> Result<DeploymentRecord, DeployError> {
        let record = deploy_record(
            self.remote.as_ref(),
            &self.retry,
            &request.name,
            latest,
            request.kind,
            &request.args,
        )
        .await?;
        self.store.save(&request.name, &record)?;
        self.journal.record(
            JournalAction::Deploy,
            &request.name,
            Some(&record.address),
            record.code_fingerprint,
        );
        Ok(record)
    }

    async fn upgrade_in_place(
        &self,
        record: DeploymentRecord,
        request: &EnsureRequest,
        latest: &ResolvedArtifact,
        target: Fingerprint,
    ) -> Result<DeploymentRecord, DeployError> {
        let name = request.name.as_str();
        let payload = DeployPayload::from_artifact(latest, record.kind);
        with_retry(&self.retry, &format!("upgrade {name}"), || {
            self.remote
                .upgrade_instance(&record.address, &payload, &request.upgrade)
        })
        .await?;

        let upgraded = DeploymentRecord {
            interface: Interface(latest.interface.clone()),
            code_fingerprint: Some(target),
            ..record
        };
        self.store.save(name, &upgraded)?;
        self.journal.record(
            JournalAction::Upgrade,
            name,
            Some(&upgraded.address),
            upgraded.code_fingerprint,
        );
        self.refresh_implementation(upgraded).await
    }

    /// Bring the informational fields of an up-to-date record in line with
    /// what is installed
    ///
    /// Covers runs that stopped after a remote mutation landed but before
    /// every field was persisted. Issues no remote mutation.
    async fn refresh_record(
        &self,
        record: DeploymentRecord,
        latest: &ResolvedArtifact,
    ) -> Result<DeploymentRecord, DeployError> {
        let record = match latest.fingerprint {
            Some(fingerprint) if record.code_fingerprint != Some(fingerprint) => {
                let refreshed = DeploymentRecord {
                    code_fingerprint: Some(fingerprint),
                    ..record
                };
                self.store.save(&refreshed.name, &refreshed)?;
                tracing::info!(name = %refreshed.name, "refreshed stored fingerprint");
                refreshed
            }
            _ => record,
        };
        if record.kind.is_upgradeable_in_place() {
            self.refresh_implementation(record).await
        } else {
            Ok(record)
        }
    }

    /// Re-read the implementation behind a proxy or beacon and store it if it moved
    async fn refresh_implementation(
        &self,
        record: DeploymentRecord,
    ) -> Result<DeploymentRecord, DeployError> {
        let implementation = with_retry(
            &self.retry,
            &format!("read implementation of {}", record.name),
            || self.remote.read_implementation_address(&record.address),
        )
        .await?;
        if record.implementation.as_ref() == Some(&implementation) {
            return Ok(record);
        }

        let refreshed = DeploymentRecord {
            implementation: Some(implementation),
            ..record
        };
        self.store.save(&refreshed.name, &refreshed)?;
        tracing::debug!(
            name = %refreshed.name,
            implementation = ?refreshed.implementation,
            "stored implementation address"
        );
        Ok(refreshed)
    }
}

/// Deploy `latest` as a fresh instance and build its record under `record_name`
///
/// The record fingerprint is the build fingerprint, or the fingerprint of the
/// code read back from the new instance when the build does not carry one.
pub(crate) async fn deploy_record(
    remote: &dyn RemoteEnvironment,
    retry: &RetryPolicy,
    record_name: &str,
    latest: &ResolvedArtifact,
    kind: DeploymentKind,
    args: &[serde_json::Value],
) -> Result<DeploymentRecord, DeployError> {
    let payload = DeployPayload::from_artifact(latest, kind);
    let address = with_retry(retry, &format!("deploy {record_name}"), || {
        remote.deploy_instance(&payload, args)
    })
    .await?;
    tracing::info!(name = record_name, %kind, %address, "deployed instance");

    let implementation = if kind.is_upgradeable_in_place() {
        let implementation = with_retry(
            retry,
            &format!("read implementation of {record_name}"),
            || remote.read_implementation_address(&address),
        )
        .await?;
        Some(implementation)
    } else {
        None
    };

    let code_fingerprint = match latest.fingerprint {
        Some(fingerprint) => Some(fingerprint),
        None => {
            let code_at = implementation.as_ref().unwrap_or(&address);
            let code = with_retry(retry, &format!("read code of {record_name}"), || {
                remote.read_installed_code(code_at)
            })
            .await?;
            (!code.is_empty()).then(|| Fingerprint::of_code(&code))
        }
    };

    Ok(DeploymentRecord {
        name: record_name.to_string(),
        address,
        interface: Interface(latest.interface.clone()),
        code_fingerprint,
        kind,
        implementation,
        args: args.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_builder() {
        let request = EnsureRequest::new("Vault", DeploymentKind::ProxyUups, BuildRef::catalog("Vault"))
            .args(vec![json!("0xowner")])
            .upgrade(UpgradeOptions::with_call("initializeV2", vec![]));
        assert_eq!(request.args, vec![json!("0xowner")]);
        assert!(request.upgrade.call.is_some());
    }

    #[test]
    fn stale_policy_names() {
        let policy: StaleRecordPolicy = serde_json::from_value(json!("fail")).unwrap();
        assert_eq!(policy, StaleRecordPolicy::Fail);
        assert_eq!(StaleRecordPolicy::default(), StaleRecordPolicy::Redeploy);
    }

    #[test]
    fn actions_display() {
        assert_eq!(EnsureAction::NoOp.to_string(), "no-op");
        assert_eq!(EnsureAction::Migrated.to_string(), "migrated");
    }
}

//! Error types for the rollout kernel
//!
//! Provides one taxonomy for:
//! - Planning failures (cycles, unknown tags, duplicate steps)
//! - Store and catalog failures
//! - Ownership policy violations
//! - Remote failures that outlived the retry budget
//! - Step and migration failures carrying their cause

use crate::migration::PromotePhase;
use crate::remote::RemoteError;
use crate::store::StoreError;
use crate::types::{Address, DeploymentKind};
use rollout_artifact::{CatalogError, ResolveError};

/// Main kernel error type
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Named build reference does not exist in the catalog
    #[error("artifact not found in build catalog: {0}")]
    ArtifactNotFound(String),

    /// Required record is missing from the store
    #[error("no deployment record named '{0}'")]
    NotFound(String),

    /// Step dependencies form a cycle
    #[error("cyclic dependency between steps: {steps:?}")]
    CyclicDependency { steps: Vec<String> },

    /// Requested tag is not produced by any step
    #[error("no step produces tag '{0}'")]
    UnknownTag(String),

    /// Two steps share a name
    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    /// Target is an external reference this process does not own
    #[error("'{0}' is an external reference and cannot be deployed or upgraded")]
    ForeignRecordImmutable(String),

    /// Adopting an external reference over a record this process owns
    #[error("'{name}' is already deployed by this process at {address}")]
    OwnedRecordConflict { name: String, address: Address },

    /// Record exists with a different deployment kind
    #[error("'{name}' is recorded as {recorded} but was requested as {requested}")]
    KindMismatch {
        name: String,
        recorded: DeploymentKind,
        requested: DeploymentKind,
    },

    /// Record points at an address with no installed code
    #[error("record '{name}' points at {address} but no code is installed there")]
    EnvironmentMismatch { name: String, address: Address },

    /// Remote operation kept failing past its retry budget
    #[error("{label} failed after {attempts} attempt(s): {source}")]
    RetryExhausted {
        label: String,
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    /// Promote step of the swap protocol failed
    #[error("migration of '{name}' failed while {phase}: {source}")]
    MigrationFailed {
        name: String,
        phase: PromotePhase,
        #[source]
        source: Box<DeployError>,
    },

    /// Step action failed; the rest of the plan was not run
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: Box<DeployError>,
    },

    /// Record store failure
    #[error("store error: {0}")]
    Store(StoreError),

    /// Build catalog failure
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Error raised by a caller-supplied step body
    #[error("step action error: {0}")]
    Action(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl DeployError {
    /// Wrap an arbitrary error raised inside a step body
    pub fn action(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Action(error.into())
    }

    /// Check if re-invoking the run later can succeed
    ///
    /// Only transient remote failures qualify; everything else is a logical
    /// error that a retry cannot change.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RetryExhausted { .. } => true,
            Self::MigrationFailed { source, .. } | Self::StepFailed { source, .. } => {
                source.is_retryable()
            }
            _ => false,
        }
    }

    /// Check if the error was raised while planning, before any remote call
    #[inline]
    #[must_use]
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            Self::CyclicDependency { .. } | Self::UnknownTag(_) | Self::DuplicateStep(_)
        )
    }

    /// Innermost error, looking through step and migration wrappers
    #[must_use]
    pub fn root_cause(&self) -> &DeployError {
        match self {
            Self::MigrationFailed { source, .. } | Self::StepFailed { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

impl From<StoreError> for DeployError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(name) => DeployError::NotFound(name),
            other => DeployError::Store(other),
        }
    }
}

impl From<ResolveError> for DeployError {
    fn from(value: ResolveError) -> Self {
        match value {
            ResolveError::ArtifactNotFound(name) => DeployError::ArtifactNotFound(name),
            ResolveError::Catalog(e) => DeployError::Catalog(e),
        }
    }
}

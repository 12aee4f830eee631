//! Remote execution environment seam
//!
//! The kernel never talks to a network directly. Every read and mutation goes
//! through a [`RemoteEnvironment`] supplied by the caller; tests use an
//! in-memory simulator.

use crate::types::{Address, DeploymentKind, Interface};
use rollout_artifact::ResolvedArtifact;
use serde::{Deserialize, Serialize};

/// Remote environment trait
///
/// Implement this trait to connect the engine to a real network.
/// `deploy_instance` and `upgrade_instance` return only once the change is
/// confirmed.
#[async_trait::async_trait]
pub trait RemoteEnvironment: Send + Sync {
    /// Create a new instance and return its address
    async fn deploy_instance(
        &self,
        payload: &DeployPayload,
        args: &[serde_json::Value],
    ) -> Result<Address, RemoteError>;

    /// Replace the implementation behind a proxy or beacon
    async fn upgrade_instance(
        &self,
        address: &Address,
        payload: &DeployPayload,
        options: &UpgradeOptions,
    ) -> Result<(), RemoteError>;

    /// Runtime code installed at `address`; empty when nothing is installed
    async fn read_installed_code(&self, address: &Address) -> Result<Vec<u8>, RemoteError>;

    /// Implementation address a proxy or beacon currently delegates to
    async fn read_implementation_address(&self, address: &Address)
        -> Result<Address, RemoteError>;
}

/// Build payload handed to the remote environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployPayload {
    /// Logical name being deployed
    pub name: String,
    /// Deployment pattern the remote side must set up
    pub kind: DeploymentKind,
    /// Interface description
    pub interface: Interface,
    /// Creation code
    pub bytecode: Vec<u8>,
    /// Runtime code, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_bytecode: Option<Vec<u8>>,
}

impl DeployPayload {
    /// Build a payload from a resolved artifact
    pub fn from_artifact(artifact: &ResolvedArtifact, kind: DeploymentKind) -> Self {
        Self {
            name: artifact.name.clone(),
            kind,
            interface: Interface(artifact.interface.clone()),
            bytecode: artifact.bytecode.clone(),
            deployed_bytecode: artifact.deployed_bytecode.clone(),
        }
    }
}

/// Initializer invoked right after an in-place upgrade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeCall {
    pub method: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

/// Options for in-place upgrades
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<UpgradeCall>,
}

impl UpgradeOptions {
    /// Upgrade followed by a call to `method`
    pub fn with_call(method: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            call: Some(UpgradeCall {
                method: method.into(),
                args,
            }),
        }
    }
}

/// Failures reported by the remote environment
///
/// All variants are treated as transient by the retry executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote rejected the request: {0}")]
    Rejected(String),

    #[error("remote call timed out")]
    Timeout,
}

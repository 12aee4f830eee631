//! Artifact reference resolution
//!
//! Turns a logical name plus a [`BuildRef`] into the interface, payload and
//! runtime-code fingerprint the deploy engine works with. Resolution is a pure
//! lookup; the only I/O is a catalog (cache) read.

use crate::catalog::{BuildCatalog, CatalogError};
use crate::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Raw interface and code supplied inline by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineArtifact {
    /// Interface description
    pub interface: serde_json::Value,
    /// Creation code
    pub bytecode: Vec<u8>,
    /// Runtime code, when the caller knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_bytecode: Option<Vec<u8>>,
}

/// Where the build payload for a target comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildRef {
    /// Named contract in the build catalog
    Catalog(String),
    /// Payload supplied inline
    Inline(InlineArtifact),
}

impl BuildRef {
    /// Reference a catalog contract by name
    pub fn catalog(name: impl Into<String>) -> Self {
        Self::Catalog(name.into())
    }
}

/// Everything the engine needs to know about the latest build of a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    /// Logical name of the target
    pub name: String,
    /// Interface description
    pub interface: serde_json::Value,
    /// Creation code
    pub bytecode: Vec<u8>,
    /// Runtime code, if known
    pub deployed_bytecode: Option<Vec<u8>>,
    /// Fingerprint of the runtime code, if known
    pub fingerprint: Option<Fingerprint>,
}

/// Resolves build references against a catalog
#[derive(Clone)]
pub struct ArtifactResolver {
    catalog: Arc<dyn BuildCatalog>,
}

impl std::fmt::Debug for ArtifactResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactResolver").finish_non_exhaustive()
    }
}

impl ArtifactResolver {
    /// Create a resolver over the given catalog
    pub fn new(catalog: Arc<dyn BuildCatalog>) -> Self {
        Self { catalog }
    }

    /// Underlying catalog
    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn BuildCatalog> {
        &self.catalog
    }

    /// Resolve `build` for the logical target `name`
    ///
    /// # Errors
    /// - [`ResolveError::ArtifactNotFound`] if a catalog reference does not exist
    /// - [`ResolveError::Catalog`] if the catalog cannot be read
    pub fn resolve(&self, name: &str, build: &BuildRef) -> Result<ResolvedArtifact, ResolveError> {
        match build {
            BuildRef::Catalog(contract) => {
                let entry = self
                    .catalog
                    .lookup(contract)?
                    .ok_or_else(|| ResolveError::ArtifactNotFound(contract.clone()))?;
                Ok(ResolvedArtifact {
                    name: name.to_string(),
                    interface: entry.interface.clone(),
                    bytecode: entry.bytecode.clone(),
                    fingerprint: known_runtime(&entry.deployed_bytecode).map(Fingerprint::of_code),
                    deployed_bytecode: known_runtime(&entry.deployed_bytecode).map(<[u8]>::to_vec),
                })
            }
            BuildRef::Inline(inline) => {
                let runtime = inline.deployed_bytecode.as_deref().and_then(known_runtime);
                Ok(ResolvedArtifact {
                    name: name.to_string(),
                    interface: inline.interface.clone(),
                    bytecode: inline.bytecode.clone(),
                    fingerprint: runtime.map(Fingerprint::of_code),
                    deployed_bytecode: runtime.map(<[u8]>::to_vec),
                })
            }
        }
    }
}

/// Empty runtime code means the build output did not include it
fn known_runtime(code: &[u8]) -> Option<&[u8]> {
    (!code.is_empty()).then_some(code)
}

/// Errors raised while resolving build references
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// Named contract does not exist in the build catalog
    #[error("artifact not found in build catalog: {0}")]
    ArtifactNotFound(String),

    /// Catalog could not be read
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

//! Rollout Artifact System
//!
//! Build outputs and code fingerprints for the deployment orchestrator.
//!
//! # Core Concepts
//!
//! - [`Fingerprint`]: 32-byte Blake3 digest of runtime code
//! - [`BuildCatalog`]: lookup of compiled contracts by name
//! - [`BuildRef`]: catalog reference or inline payload
//! - [`ArtifactResolver`]: resolves a target's latest build
//!
//! # Example
//!
//! ```rust,ignore
//! use rollout_artifact::{ArtifactResolver, BuildRef, DirectoryCatalog};
//!
//! let resolver = ArtifactResolver::new(Arc::new(DirectoryCatalog::new("artifacts")));
//! let latest = resolver.resolve("Token", &BuildRef::catalog("Token"))?;
//! println!("fingerprint: {:?}", latest.fingerprint);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod catalog;
mod fingerprint;
mod resolver;

pub use catalog::{BuildCatalog, CatalogEntry, CatalogError, DirectoryCatalog, InMemoryCatalog};
pub use fingerprint::{decode_hex, Fingerprint, FingerprintError};
pub use resolver::{ArtifactResolver, BuildRef, InlineArtifact, ResolveError, ResolvedArtifact};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

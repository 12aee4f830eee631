//! Build catalogs
//!
//! A [`BuildCatalog`] maps logical contract names to the outputs of the
//! build: interface description, creation code and runtime code.

use crate::fingerprint::{decode_hex, Fingerprint};
use dashmap::DashMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One compiled contract as produced by the build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Contract name in the catalog
    pub name: String,
    /// Interface description (opaque to the orchestrator)
    pub interface: serde_json::Value,
    /// Creation code, including constructor-only code
    pub bytecode: Vec<u8>,
    /// Runtime code as it will be installed
    pub deployed_bytecode: Vec<u8>,
}

impl CatalogEntry {
    /// Create a catalog entry
    pub fn new(
        name: impl Into<String>,
        interface: serde_json::Value,
        bytecode: Vec<u8>,
        deployed_bytecode: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            interface,
            bytecode,
            deployed_bytecode,
        }
    }

    /// Fingerprint of the runtime code section
    #[inline]
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_code(&self.deployed_bytecode)
    }
}

/// Lookup of build outputs by contract name
pub trait BuildCatalog: Send + Sync {
    /// Look up a contract by name
    ///
    /// Returns `Ok(None)` when the catalog has no such contract.
    ///
    /// # Errors
    /// Returns error if the catalog exists but cannot be read
    fn lookup(&self, name: &str) -> Result<Option<Arc<CatalogEntry>>, CatalogError>;

    /// Names of all contracts currently known to the catalog
    ///
    /// # Errors
    /// Returns error if the catalog cannot be enumerated
    fn names(&self) -> Result<Vec<String>, CatalogError>;
}

/// Catalog held entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entries: DashMap<String, Arc<CatalogEntry>>,
}

impl InMemoryCatalog {
    /// Create an empty catalog
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry, keyed by its name
    pub fn insert(&self, entry: CatalogEntry) {
        self.entries.insert(entry.name.clone(), Arc::new(entry));
    }

    /// Builder-style insert
    #[must_use]
    pub fn with_entry(self, entry: CatalogEntry) -> Self {
        self.insert(entry);
        self
    }
}

impl BuildCatalog for InMemoryCatalog {
    fn lookup(&self, name: &str) -> Result<Option<Arc<CatalogEntry>>, CatalogError> {
        Ok(self.entries.get(name).map(|e| Arc::clone(e.value())))
    }

    fn names(&self) -> Result<Vec<String>, CatalogError> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }
}

/// On-disk shape of one build output file
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildOutputFile {
    #[serde(default)]
    contract_name: Option<String>,
    abi: serde_json::Value,
    bytecode: String,
    deployed_bytecode: String,
}

/// Catalog backed by a directory of `<Name>.json` build outputs
///
/// Parsed files are cached for the lifetime of the catalog.
#[derive(Debug)]
pub struct DirectoryCatalog {
    root: PathBuf,
    cache: DashMap<String, Arc<CatalogEntry>>,
}

impl DirectoryCatalog {
    /// Create a catalog reading from `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: DashMap::new(),
        }
    }

    /// Directory the catalog reads from
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Drop a cached entry so the next lookup re-reads the file
    pub fn invalidate(&self, name: &str) {
        self.cache.remove(name);
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    fn read_entry(&self, name: &str, path: &Path) -> Result<CatalogEntry, CatalogError> {
        let raw = std::fs::read(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: BuildOutputFile =
            serde_json::from_slice(&raw).map_err(|e| CatalogError::Malformed {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        if let Some(declared) = file.contract_name.as_deref() {
            if declared != name {
                return Err(CatalogError::Malformed {
                    path: path.to_path_buf(),
                    message: format!("file declares contract '{declared}', expected '{name}'"),
                });
            }
        }
        let decode = |field: &str, value: &str| {
            decode_hex(value).map_err(|e| CatalogError::Malformed {
                path: path.to_path_buf(),
                message: format!("{field}: {e}"),
            })
        };
        Ok(CatalogEntry {
            name: name.to_string(),
            interface: file.abi,
            bytecode: decode("bytecode", &file.bytecode)?,
            deployed_bytecode: decode("deployedBytecode", &file.deployed_bytecode)?,
        })
    }
}

impl BuildCatalog for DirectoryCatalog {
    fn lookup(&self, name: &str) -> Result<Option<Arc<CatalogEntry>>, CatalogError> {
        if let Some(hit) = self.cache.get(name) {
            return Ok(Some(Arc::clone(hit.value())));
        }
        let path = self.entry_path(name);
        if !path.is_file() {
            return Ok(None);
        }
        let entry = Arc::new(self.read_entry(name, &path)?);
        tracing::debug!(contract = name, path = %path.display(), "loaded build output");
        self.cache.insert(name.to_string(), Arc::clone(&entry));
        Ok(Some(entry))
    }

    fn names(&self) -> Result<Vec<String>, CatalogError> {
        let dir = std::fs::read_dir(&self.root).map_err(|source| CatalogError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut names = Vec::new();
        for entry in dir {
            let entry = entry.map_err(|source| CatalogError::Io {
                path: self.root.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Errors raised by catalogs
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// Build output could not be read
    #[error("io error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Build output is not in the expected shape
    #[error("malformed build output {}: {message}", path.display())]
    Malformed { path: PathBuf, message: String },
}

//! Core types for the rollout kernel
//!
//! Defines the deployment record model and the target environment steps are
//! planned against.

use rollout_artifact::Fingerprint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Opaque location handle in the remote environment
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
    /// Create an address from any string-like value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw handle
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Structural description of a callable surface
///
/// Used by callers to build clients; never interpreted by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Interface(pub serde_json::Value);

/// How a target is deployed and upgraded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    /// Plain instance; replaced wholesale on upgrade
    Direct,
    /// Proxy whose implementation is upgraded in place
    ProxyUups,
    /// Beacon whose implementation is upgraded in place
    Beacon,
    /// Externally supplied; never deployed or upgraded here
    External,
}

impl DeploymentKind {
    /// Whether the stable address delegates to a separate implementation
    #[inline]
    #[must_use]
    pub fn is_upgradeable_in_place(self) -> bool {
        matches!(self, DeploymentKind::ProxyUups | DeploymentKind::Beacon)
    }

    /// Stable lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentKind::Direct => "direct",
            DeploymentKind::ProxyUups => "proxy_uups",
            DeploymentKind::Beacon => "beacon",
            DeploymentKind::External => "external",
        }
    }
}

impl fmt::Display for DeploymentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted binding of a logical name to a deployed instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Logical name, stable across redeploys
    pub name: String,
    /// Location of the instance (the proxy or beacon for in-place kinds)
    pub address: Address,
    /// Interface description
    pub interface: Interface,
    /// Fingerprint of the installed runtime code, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_fingerprint: Option<Fingerprint>,
    /// Deployment pattern
    pub kind: DeploymentKind,
    /// Implementation address last observed behind a proxy or beacon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<Address>,
    /// Constructor arguments used for the deployment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<serde_json::Value>,
}

impl DeploymentRecord {
    /// Create a record without implementation or args
    pub fn new(
        name: impl Into<String>,
        address: Address,
        interface: Interface,
        code_fingerprint: Option<Fingerprint>,
        kind: DeploymentKind,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            interface,
            code_fingerprint,
            kind,
            implementation: None,
            args: Vec::new(),
        }
    }

    /// Copy of this record renamed to `name`
    #[must_use]
    pub fn renamed(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..self.clone()
        }
    }

    /// Whether this record was supplied from outside
    #[inline]
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.kind == DeploymentKind::External
    }
}

/// Environment a plan is being run against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEnvironment {
    /// Network name (e.g. `localhost`, `mainnet`)
    pub name: String,
    /// Chain identifier
    pub chain_id: u64,
    /// Whether this is a live network rather than a local test network
    #[serde(default)]
    pub live: bool,
    /// Free-form labels for applicability predicates
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl TargetEnvironment {
    /// Create an environment with no tags
    pub fn new(name: impl Into<String>, chain_id: u64) -> Self {
        Self {
            name: name.into(),
            chain_id,
            live: false,
            tags: BTreeSet::new(),
        }
    }

    /// Mark as live network
    #[must_use]
    pub fn live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Add a label
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Check for a label
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

impl Default for TargetEnvironment {
    fn default() -> Self {
        Self::new("localhost", 31337)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_json_shape() {
        let record = DeploymentRecord::new(
            "Token",
            Address::new("0xabc"),
            Interface(json!([])),
            Some(Fingerprint::of_code(b"code")),
            DeploymentKind::ProxyUups,
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["address"], json!("0xabc"));
        assert_eq!(value["kind"], json!("proxy_uups"));
        assert!(value.get("implementation").is_none());
        assert!(value.get("args").is_none());

        let back: DeploymentRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn external_records_have_no_fingerprint_field() {
        let record = DeploymentRecord::new(
            "Weth",
            Address::new("0xc02a"),
            Interface::default(),
            None,
            DeploymentKind::External,
        );
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("code_fingerprint").is_none());
        assert!(record.is_external());
    }

    #[test]
    fn in_place_kinds() {
        assert!(DeploymentKind::ProxyUups.is_upgradeable_in_place());
        assert!(DeploymentKind::Beacon.is_upgradeable_in_place());
        assert!(!DeploymentKind::Direct.is_upgradeable_in_place());
        assert!(!DeploymentKind::External.is_upgradeable_in_place());
    }

    #[test]
    fn environment_tags() {
        let env = TargetEnvironment::new("sepolia", 11_155_111)
            .live(true)
            .with_tag("testnet");
        assert!(env.live);
        assert!(env.has_tag("testnet"));
        assert!(!env.has_tag("mainnet"));
    }
}

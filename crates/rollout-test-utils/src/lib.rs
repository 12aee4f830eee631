//! Testing utilities for the rollout workspace
//!
//! Shared test helpers, fixtures, and a deterministic in-memory chain.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rollout_artifact::{ArtifactResolver, CatalogEntry, Fingerprint, InMemoryCatalog};
use rollout_kernel::engine::DeployEngine;
use rollout_kernel::remote::{DeployPayload, RemoteEnvironment, RemoteError, UpgradeCall, UpgradeOptions};
use rollout_kernel::retry::RetryPolicy;
use rollout_kernel::store::{MemoryRecordStore, RecordStore, StoreError};
use rollout_kernel::types::{Address, DeploymentKind, DeploymentRecord};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Address reported for proxies with no implementation set
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Runtime code installed at proxy and beacon addresses
pub const PROXY_CODE: &[u8] = b"\x60\x80delegatecall";

#[derive(Debug, Default)]
struct ChainState {
    next_address: u64,
    code: HashMap<Address, Vec<u8>>,
    implementation: HashMap<Address, Address>,
    deploys: u32,
    upgrades: u32,
    mutation_attempts: u32,
    failing_mutations: u32,
    failing_reads: u32,
    reads_failing_after_upgrade: u32,
    upgrade_calls: Vec<Option<UpgradeCall>>,
}

impl ChainState {
    fn allocate(&mut self) -> Address {
        self.next_address += 1;
        Address::new(format!("0x{:040x}", self.next_address))
    }

    fn take_mutation_fault(&mut self) -> Result<(), RemoteError> {
        self.mutation_attempts += 1;
        if self.failing_mutations > 0 {
            self.failing_mutations -= 1;
            return Err(RemoteError::Transport("injected mutation failure".to_string()));
        }
        Ok(())
    }

    fn take_read_fault(&mut self) -> Result<(), RemoteError> {
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(RemoteError::Timeout);
        }
        Ok(())
    }
}

/// Deterministic in-memory remote environment
///
/// Addresses are allocated sequentially (`0x…01`, `0x…02`, …). Proxy and
/// beacon deployments allocate the implementation first, then the proxy.
#[derive(Debug, Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` deploy/upgrade calls with a transport error
    pub fn fail_next_mutations(&self, n: u32) {
        self.state.lock().failing_mutations = n;
    }

    /// Fail the next `n` read calls with a timeout
    pub fn fail_next_reads(&self, n: u32) {
        self.state.lock().failing_reads = n;
    }

    /// Fail the `n` reads that follow the next successful upgrade
    pub fn fail_reads_after_upgrade(&self, n: u32) {
        self.state.lock().reads_failing_after_upgrade = n;
    }

    /// Successful deploy plus upgrade calls
    pub fn mutations(&self) -> u32 {
        let state = self.state.lock();
        state.deploys + state.upgrades
    }

    pub fn deploys(&self) -> u32 {
        self.state.lock().deploys
    }

    pub fn upgrades(&self) -> u32 {
        self.state.lock().upgrades
    }

    /// Deploy/upgrade calls including failed ones
    pub fn mutation_attempts(&self) -> u32 {
        self.state.lock().mutation_attempts
    }

    /// Initializer calls passed with each upgrade, in order
    pub fn upgrade_calls(&self) -> Vec<Option<UpgradeCall>> {
        self.state.lock().upgrade_calls.clone()
    }

    pub fn code_at(&self, address: &Address) -> Option<Vec<u8>> {
        self.state.lock().code.get(address).cloned()
    }

    pub fn implementation_of(&self, proxy: &Address) -> Option<Address> {
        self.state.lock().implementation.get(proxy).cloned()
    }

    /// Install code out of band
    pub fn set_code(&self, address: &Address, code: &[u8]) {
        self.state.lock().code.insert(address.clone(), code.to_vec());
    }

    /// Remove everything installed at `address`
    pub fn clear_code(&self, address: &Address) {
        self.state.lock().code.remove(address);
    }

    /// Wipe all installed code, as after restarting a local test network
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.code.clear();
        state.implementation.clear();
    }
}

fn runtime_code(payload: &DeployPayload) -> Vec<u8> {
    payload
        .deployed_bytecode
        .clone()
        .unwrap_or_else(|| payload.bytecode.clone())
}

#[async_trait]
impl RemoteEnvironment for MockChain {
    async fn deploy_instance(
        &self,
        payload: &DeployPayload,
        _args: &[serde_json::Value],
    ) -> Result<Address, RemoteError> {
        let mut state = self.state.lock();
        state.take_mutation_fault()?;

        let code = runtime_code(payload);
        let address = match payload.kind {
            DeploymentKind::Direct => {
                let address = state.allocate();
                state.code.insert(address.clone(), code);
                address
            }
            DeploymentKind::ProxyUups | DeploymentKind::Beacon => {
                let implementation = state.allocate();
                state.code.insert(implementation.clone(), code);
                let proxy = state.allocate();
                state.code.insert(proxy.clone(), PROXY_CODE.to_vec());
                state.implementation.insert(proxy.clone(), implementation);
                proxy
            }
            DeploymentKind::External => {
                return Err(RemoteError::Rejected("cannot deploy an external reference".to_string()));
            }
        };
        state.deploys += 1;
        Ok(address)
    }

    async fn upgrade_instance(
        &self,
        address: &Address,
        payload: &DeployPayload,
        options: &UpgradeOptions,
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.take_mutation_fault()?;
        if !state.implementation.contains_key(address) {
            return Err(RemoteError::Rejected(format!("{address} is not upgradeable")));
        }

        let implementation = state.allocate();
        state.code.insert(implementation.clone(), runtime_code(payload));
        state.implementation.insert(address.clone(), implementation);
        state.upgrade_calls.push(options.call.clone());
        state.upgrades += 1;
        state.failing_reads = std::mem::take(&mut state.reads_failing_after_upgrade);
        Ok(())
    }

    async fn read_installed_code(&self, address: &Address) -> Result<Vec<u8>, RemoteError> {
        let mut state = self.state.lock();
        state.take_read_fault()?;
        Ok(state.code.get(address).cloned().unwrap_or_default())
    }

    async fn read_implementation_address(&self, address: &Address) -> Result<Address, RemoteError> {
        let mut state = self.state.lock();
        state.take_read_fault()?;
        // an unset implementation slot reads as the zero address
        Ok(state
            .implementation
            .get(address)
            .cloned()
            .unwrap_or_else(|| Address::new(ZERO_ADDRESS)))
    }
}

/// Store operation a fault can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    Save,
    Delete,
}

#[derive(Debug)]
struct Fault {
    op: StoreOp,
    name: String,
    remaining: u32,
}

/// Record store wrapper that fails chosen operations on chosen names
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: MemoryRecordStore,
    faults: Mutex<Vec<Fault>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op` on `name`
    pub fn fail(&self, op: StoreOp, name: &str, times: u32) {
        self.faults.lock().push(Fault {
            op,
            name: name.to_string(),
            remaining: times,
        });
    }

    /// Remove all pending faults
    pub fn heal(&self) {
        self.faults.lock().clear();
    }

    pub fn inner(&self) -> &MemoryRecordStore {
        &self.inner
    }

    fn check(&self, op: StoreOp, name: &str) -> Result<(), StoreError> {
        let mut faults = self.faults.lock();
        if let Some(fault) = faults
            .iter_mut()
            .find(|f| f.op == op && f.name == name && f.remaining > 0)
        {
            fault.remaining -= 1;
            return Err(StoreError::Unavailable(format!("injected {op:?} failure for {name}")));
        }
        Ok(())
    }
}

impl RecordStore for FaultyStore {
    fn get_or_null(&self, name: &str) -> Result<Option<DeploymentRecord>, StoreError> {
        self.check(StoreOp::Get, name)?;
        self.inner.get_or_null(name)
    }

    fn save(&self, name: &str, record: &DeploymentRecord) -> Result<(), StoreError> {
        self.check(StoreOp::Save, name)?;
        self.inner.save(name, record)
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.check(StoreOp::Delete, name)?;
        self.inner.delete(name)
    }

    fn names(&self) -> Result<Vec<String>, StoreError> {
        self.inner.names()
    }
}

/// Catalog entry whose creation code wraps `runtime`
pub fn build_output(name: &str, runtime: &[u8]) -> CatalogEntry {
    let mut bytecode = b"\x60\x80ctor".to_vec();
    bytecode.extend_from_slice(runtime);
    CatalogEntry::new(
        name,
        serde_json::json!([{"type": "function", "name": "version"}]),
        bytecode,
        runtime.to_vec(),
    )
}

/// Retry policy that retries without sleeping
pub fn instant_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::ZERO)
}

/// Engine, chain, store and catalog wired together
pub struct Harness<S: RecordStore + 'static = MemoryRecordStore> {
    pub store: Arc<S>,
    pub chain: Arc<MockChain>,
    pub catalog: Arc<InMemoryCatalog>,
    pub engine: Arc<DeployEngine>,
}

impl Harness<MemoryRecordStore> {
    pub fn new() -> Self {
        Self::with_store(MemoryRecordStore::new())
    }
}

impl Default for Harness<MemoryRecordStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: RecordStore + 'static> Harness<S> {
    pub fn with_store(store: S) -> Self {
        Self::build(Arc::new(store), |engine| engine)
    }

    /// Build with a customised engine
    pub fn build(store: Arc<S>, configure: impl FnOnce(DeployEngine) -> DeployEngine) -> Self {
        let chain = Arc::new(MockChain::new());
        let catalog = Arc::new(InMemoryCatalog::new());
        let engine = DeployEngine::new(
            store.clone(),
            chain.clone(),
            ArtifactResolver::new(catalog.clone()),
        )
        .with_retry_policy(instant_retry(3));
        Self {
            store,
            chain,
            catalog,
            engine: Arc::new(configure(engine)),
        }
    }

    /// Publish a new build of `name` with the given runtime code
    pub fn publish(&self, name: &str, runtime: &[u8]) -> Fingerprint {
        let entry = build_output(name, runtime);
        let fingerprint = entry.fingerprint();
        self.catalog.insert(entry);
        fingerprint
    }

    /// Record stored under `name`
    pub fn record(&self, name: &str) -> Option<DeploymentRecord> {
        self.store.get_or_null(name).ok().flatten()
    }
}

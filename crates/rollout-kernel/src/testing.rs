//! Shared helpers for unit tests

use crate::engine::DeployEngine;
use crate::remote::{DeployPayload, RemoteEnvironment, RemoteError, UpgradeOptions};
use crate::scheduler::{step_fn, Step, StepContext};
use crate::store::MemoryRecordStore;
use crate::types::{Address, TargetEnvironment};
use parking_lot::Mutex;
use rollout_artifact::{ArtifactResolver, InMemoryCatalog};
use std::sync::Arc;

/// Remote environment with nothing installed that refuses every mutation
pub(crate) struct NoRemote;

#[async_trait::async_trait]
impl RemoteEnvironment for NoRemote {
    async fn deploy_instance(
        &self,
        _payload: &DeployPayload,
        _args: &[serde_json::Value],
    ) -> Result<Address, RemoteError> {
        Err(RemoteError::Timeout)
    }

    async fn upgrade_instance(
        &self,
        _address: &Address,
        _payload: &DeployPayload,
        _options: &UpgradeOptions,
    ) -> Result<(), RemoteError> {
        Err(RemoteError::Timeout)
    }

    async fn read_installed_code(&self, _address: &Address) -> Result<Vec<u8>, RemoteError> {
        Ok(Vec::new())
    }

    async fn read_implementation_address(&self, address: &Address) -> Result<Address, RemoteError> {
        Ok(address.clone())
    }
}

pub(crate) type Ran = Arc<Mutex<Vec<String>>>;

pub(crate) fn noop_step(name: &str) -> Step {
    Step::new(name, step_fn(|_ctx| async { Ok(()) }))
}

/// Step that appends its name to `ran` when executed
pub(crate) fn recording_step(name: &str, ran: &Ran) -> Step {
    let ran = ran.clone();
    let label = name.to_string();
    Step::new(
        name,
        step_fn(move |_ctx| {
            ran.lock().push(label.clone());
            async { Ok(()) }
        }),
    )
}

pub(crate) fn recording_context() -> (StepContext, Ran) {
    let engine = DeployEngine::new(
        Arc::new(MemoryRecordStore::new()),
        Arc::new(NoRemote),
        ArtifactResolver::new(Arc::new(InMemoryCatalog::new())),
    );
    let ctx = StepContext::new(Arc::new(engine), TargetEnvironment::default());
    (ctx, Arc::new(Mutex::new(Vec::new())))
}

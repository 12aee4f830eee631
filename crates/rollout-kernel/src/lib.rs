//! Rollout Kernel
//!
//! Idempotent deployment orchestration for networks of interdependent
//! on-chain components:
//! 1. **Change detection**: compare installed code with the latest build
//! 2. **Deploy/upgrade**: perform exactly the remote work a verdict calls for
//! 3. **Swap migration**: stage and promote replacements for direct targets
//! 4. **Scheduling**: run tagged steps in dependency order
//!
//! Every remote call goes through the retry executor.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use rollout_kernel::prelude::*;
//!
//! let engine = Arc::new(DeployEngine::new(store, remote, resolver));
//!
//! let tokens = Step::new("tokens", step_fn(|ctx| async move {
//!     let request = EnsureRequest::new("Token", DeploymentKind::ProxyUups, BuildRef::catalog("Token"));
//!     ctx.engine.ensure(&request).await?;
//!     Ok(())
//! }))
//! .tags(["tokens"]);
//!
//! let plan = Scheduler::new(vec![tokens])?.plan(&["tokens"], &env)?;
//! let report = plan.execute(&StepContext::new(engine, env)).await?;
//! ```

#![allow(missing_docs)]

pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod journal;
pub mod logging;
pub mod migration;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::DeployError;
pub use types::*;

/// Commonly used types
pub mod prelude {
    pub use crate::config::{ConfigError, DeployConfig};
    pub use crate::detector::{AbsentReason, ChangeDetector, Classification};
    pub use crate::engine::{DeployEngine, EnsureAction, EnsureRequest, Ensured, StaleRecordPolicy};
    pub use crate::error::DeployError;
    pub use crate::journal::{ActionJournal, JournalAction, JournalEntry};
    pub use crate::migration::{shadow_name, PromotePhase, SwapProtocol, DEFAULT_SHADOW_SUFFIX};
    pub use crate::remote::{DeployPayload, RemoteEnvironment, RemoteError, UpgradeCall, UpgradeOptions};
    pub use crate::retry::{with_retry, RetryPolicy};
    pub use crate::scheduler::{step_fn, Plan, RunReport, Scheduler, Step, StepAction, StepContext};
    pub use crate::store::{
        pending_migrations, JsonFileRecordStore, MemoryRecordStore, RecordStore, StoreError,
    };
    pub use crate::types::{Address, DeploymentKind, DeploymentRecord, Interface, TargetEnvironment};
    pub use rollout_artifact::{ArtifactResolver, BuildRef, Fingerprint, InlineArtifact, ResolvedArtifact};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

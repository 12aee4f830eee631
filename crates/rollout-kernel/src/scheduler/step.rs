//! Steps: named units of orchestration work

use crate::engine::DeployEngine;
use crate::error::DeployError;
use crate::types::TargetEnvironment;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Everything a step body can reach
#[derive(Debug, Clone)]
pub struct StepContext {
    pub engine: Arc<DeployEngine>,
    pub environment: TargetEnvironment,
}

impl StepContext {
    pub fn new(engine: Arc<DeployEngine>, environment: TargetEnvironment) -> Self {
        Self {
            engine,
            environment,
        }
    }
}

/// Side-effecting body of a step
#[async_trait::async_trait]
pub trait StepAction: Send + Sync {
    async fn run(&self, ctx: &StepContext) -> Result<(), DeployError>;
}

/// Step action backed by a closure; see [`step_fn`]
pub struct FnStep<F>(F);

#[async_trait::async_trait]
impl<F, Fut> StepAction for FnStep<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), DeployError>> + Send,
{
    async fn run(&self, ctx: &StepContext) -> Result<(), DeployError> {
        (self.0)(ctx.clone()).await
    }
}

/// Wrap an async closure as a step action
///
/// ```rust,ignore
/// let step = Step::new("tokens", step_fn(|ctx| async move {
///     ctx.engine.ensure(&request).await?;
///     Ok(())
/// }));
/// ```
pub fn step_fn<F, Fut>(f: F) -> FnStep<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), DeployError>> + Send,
{
    FnStep(f)
}

type Predicate = Arc<dyn Fn(&TargetEnvironment) -> bool + Send + Sync>;

/// A named unit of work with tag outputs and tag dependencies
#[derive(Clone)]
pub struct Step {
    pub(crate) name: String,
    pub(crate) tags: BTreeSet<String>,
    pub(crate) dependencies: BTreeSet<String>,
    predicate: Option<Predicate>,
    pub(crate) action: Arc<dyn StepAction>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("tags", &self.tags)
            .field("dependencies", &self.dependencies)
            .field("gated", &self.predicate.is_some())
            .finish_non_exhaustive()
    }
}

impl Step {
    pub fn new(name: impl Into<String>, action: impl StepAction + 'static) -> Self {
        Self {
            name: name.into(),
            tags: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            predicate: None,
            action: Arc::new(action),
        }
    }

    /// Tags this step satisfies once run
    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Tags that must be satisfied before this step runs
    #[must_use]
    pub fn dependencies<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Gate the step on the target environment
    ///
    /// When the predicate is false the step stays in the plan but its action
    /// is not run.
    #[must_use]
    pub fn applicable_when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&TargetEnvironment) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag_set(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn dependency_set(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    /// Evaluate the applicability predicate
    pub fn is_applicable(&self, env: &TargetEnvironment) -> bool {
        self.predicate.as_ref().map_or(true, |p| p(env))
    }
}

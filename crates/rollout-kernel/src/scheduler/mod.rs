//! Tag-DAG scheduler
//!
//! Orders steps so that every step runs after all steps producing one of its
//! dependency tags. Planning happens up front: cycles and unknown tags are
//! reported before any step action is invoked. A step never depends on
//! itself through its own tags, so steps sharing a group tag they also
//! depend on are ordered only against the other producers.
//!
//! # Ordering
//!
//! Kahn's algorithm over a petgraph `DiGraph`; among steps whose
//! predecessors have all been placed, the one declared first goes next. The
//! plan is therefore deterministic for a given step list.
//!
//! # Applicability
//!
//! Steps whose predicate rejects the target environment stay in the plan so
//! their tags still count as satisfied, but their action is replaced with a
//! logged skip.

mod step;

pub use step::{step_fn, FnStep, Step, StepAction, StepContext};

use crate::error::DeployError;
use crate::types::TargetEnvironment;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};

/// Validated step set
#[derive(Debug, Clone)]
pub struct Scheduler {
    steps: Vec<Step>,
    producers: BTreeMap<String, Vec<usize>>,
}

impl Scheduler {
    /// Build a scheduler over `steps` in declaration order
    ///
    /// # Errors
    /// [`DeployError::DuplicateStep`] if two steps share a name.
    pub fn new(steps: Vec<Step>) -> Result<Self, DeployError> {
        let mut seen = HashSet::new();
        let mut producers: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, step) in steps.iter().enumerate() {
            if !seen.insert(step.name.as_str()) {
                return Err(DeployError::DuplicateStep(step.name.clone()));
            }
            for tag in &step.tags {
                producers.entry(tag.clone()).or_default().push(idx);
            }
        }
        Ok(Self { steps, producers })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Steps producing `tag`, in declaration order
    pub fn producers_of(&self, tag: &str) -> impl Iterator<Item = &Step> {
        self.producers
            .get(tag)
            .into_iter()
            .flatten()
            .map(move |&idx| &self.steps[idx])
    }

    /// Resolve `requested_tags` into an ordered plan for `env`
    ///
    /// An empty request plans every step. Otherwise the plan holds the
    /// producers of the requested tags and, transitively, the producers of
    /// their dependency tags. Dependency tags nobody produces are treated as
    /// satisfied.
    ///
    /// The whole step set is validated regardless of the request, so a cycle
    /// anywhere fails every plan.
    ///
    /// # Errors
    /// - [`DeployError::UnknownTag`] if a requested tag has no producer
    /// - [`DeployError::CyclicDependency`] if no topological order exists
    pub fn plan<S: AsRef<str>>(
        &self,
        requested_tags: &[S],
        env: &TargetEnvironment,
    ) -> Result<Plan, DeployError> {
        let selected = self.select(requested_tags)?;
        // selections are closed under dependencies, so filtering the full
        // order yields the order of the subgraph
        let order = self.order(&(0..self.steps.len()).collect())?;

        let steps: Vec<PlannedStep> = order
            .into_iter()
            .filter(|idx| selected.contains(idx))
            .map(|idx| {
                let step = self.steps[idx].clone();
                let applicable = step.is_applicable(env);
                PlannedStep { step, applicable }
            })
            .collect();

        tracing::debug!(
            environment = %env.name,
            steps = steps.len(),
            skipped = steps.iter().filter(|s| !s.applicable).count(),
            "planned run"
        );
        Ok(Plan {
            environment: env.name.clone(),
            steps,
        })
    }

    /// Indices of the steps needed for `requested_tags`
    fn select<S: AsRef<str>>(&self, requested_tags: &[S]) -> Result<BTreeSet<usize>, DeployError> {
        if requested_tags.is_empty() {
            return Ok((0..self.steps.len()).collect());
        }

        let mut selected = BTreeSet::new();
        let mut queue = Vec::new();
        for tag in requested_tags {
            let tag = tag.as_ref();
            let producers = self
                .producers
                .get(tag)
                .ok_or_else(|| DeployError::UnknownTag(tag.to_string()))?;
            queue.extend(producers.iter().copied());
        }

        while let Some(idx) = queue.pop() {
            if !selected.insert(idx) {
                continue;
            }
            for dep in &self.steps[idx].dependencies {
                if let Some(producers) = self.producers.get(dep) {
                    queue.extend(producers.iter().copied());
                }
            }
        }
        Ok(selected)
    }

    /// Topological order of `selected`, ties broken by declaration order
    fn order(&self, selected: &BTreeSet<usize>) -> Result<Vec<usize>, DeployError> {
        let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(selected.len(), 0);
        let nodes: HashMap<usize, NodeIndex> = selected
            .iter()
            .map(|&idx| (idx, graph.add_node(idx)))
            .collect();

        for &consumer in selected {
            for dep in &self.steps[consumer].dependencies {
                for &producer in self.producers.get(dep).into_iter().flatten() {
                    if producer == consumer {
                        continue;
                    }
                    if let Some(&from) = nodes.get(&producer) {
                        graph.update_edge(from, nodes[&consumer], ());
                    }
                }
            }
        }

        let mut in_degree: HashMap<NodeIndex, usize> = graph
            .node_indices()
            .map(|n| (n, graph.neighbors_directed(n, Direction::Incoming).count()))
            .collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&n, _)| Reverse(graph[n]))
            .collect();

        let mut order = Vec::with_capacity(selected.len());
        while let Some(Reverse(idx)) = ready.pop() {
            order.push(idx);
            for next in graph.neighbors_directed(nodes[&idx], Direction::Outgoing) {
                if let Some(deg) = in_degree.get_mut(&next) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(Reverse(graph[next]));
                    }
                }
            }
        }

        if order.len() == selected.len() {
            return Ok(order);
        }

        let mut cyclic: Vec<usize> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .flatten()
            .map(|n| graph[n])
            .collect();
        cyclic.sort_unstable();
        let steps: Vec<String> = cyclic.into_iter().map(|idx| self.steps[idx].name.clone()).collect();
        tracing::error!(?steps, "dependency cycle between steps");
        Err(DeployError::CyclicDependency { steps })
    }
}

#[derive(Debug, Clone)]
struct PlannedStep {
    step: Step,
    applicable: bool,
}

/// Ordered steps ready to run
#[derive(Debug, Clone)]
pub struct Plan {
    environment: String,
    steps: Vec<PlannedStep>,
}

impl Plan {
    /// Step names in execution order, skipped steps included
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.step.name()).collect()
    }

    /// Names of steps that will be skipped on this environment
    pub fn skipped(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| !s.applicable)
            .map(|s| s.step.name())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the plan sequentially, stopping at the first failure
    ///
    /// # Errors
    /// [`DeployError::StepFailed`] wrapping the failing step's error; later
    /// steps are not run.
    pub async fn execute(&self, ctx: &StepContext) -> Result<RunReport, DeployError> {
        let mut report = RunReport::default();
        for planned in &self.steps {
            let name = planned.step.name();
            if !planned.applicable {
                tracing::info!(step = name, environment = %self.environment, "step not applicable, skipping");
                report.skipped.push(name.to_string());
                continue;
            }

            tracing::info!(step = name, "running step");
            if let Err(source) = planned.step.action.run(ctx).await {
                tracing::error!(step = name, error = %source, "step failed, aborting run");
                return Err(DeployError::StepFailed {
                    step: name.to_string(),
                    source: Box::new(source),
                });
            }
            report.executed.push(name.to_string());
        }
        Ok(report)
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{noop_step, recording_context};
    use pretty_assertions::assert_eq;

    fn env() -> TargetEnvironment {
        TargetEnvironment::default()
    }

    fn scheduler(steps: Vec<Step>) -> Scheduler {
        Scheduler::new(steps).unwrap()
    }

    #[test]
    fn orders_by_dependencies_then_declaration() {
        let s = scheduler(vec![
            noop_step("pools").tags(["pools"]).dependencies(["tokens", "oracles"]),
            noop_step("oracles").tags(["oracles"]),
            noop_step("tokens").tags(["tokens"]),
            noop_step("docs"),
        ]);

        let plan = s.plan::<&str>(&[], &env()).unwrap();
        assert_eq!(plan.step_names(), vec!["oracles", "tokens", "pools", "docs"]);
    }

    #[test]
    fn requested_tags_pull_in_dependencies_only() {
        let s = scheduler(vec![
            noop_step("tokens").tags(["tokens"]),
            noop_step("oracles").tags(["oracles"]),
            noop_step("pools").tags(["pools"]).dependencies(["tokens"]),
        ]);

        let plan = s.plan(&["pools"], &env()).unwrap();
        assert_eq!(plan.step_names(), vec!["tokens", "pools"]);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let s = scheduler(vec![noop_step("tokens").tags(["tokens"])]);
        let err = s.plan(&["vaults"], &env()).unwrap_err();
        assert!(matches!(err, DeployError::UnknownTag(ref t) if t == "vaults"));
    }

    #[test]
    fn unproduced_dependency_is_vacuous() {
        let s = scheduler(vec![noop_step("pools").tags(["pools"]).dependencies(["external"])]);
        assert_eq!(s.plan(&["pools"], &env()).unwrap().step_names(), vec!["pools"]);
    }

    #[test]
    fn cycle_names_every_step_involved() {
        let s = scheduler(vec![
            noop_step("a").tags(["a"]).dependencies(["c"]),
            noop_step("b").tags(["b"]).dependencies(["a"]),
            noop_step("c").tags(["c"]).dependencies(["b"]),
            noop_step("d").tags(["d"]).dependencies(["a"]),
        ]);
        let err = s.plan::<&str>(&[], &env()).unwrap_err();
        match err {
            DeployError::CyclicDependency { steps } => assert_eq!(steps, vec!["a", "b", "c"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn own_tags_do_not_create_a_dependency() {
        let s = scheduler(vec![noop_step("a").tags(["a"]).dependencies(["a"])]);
        assert_eq!(s.plan::<&str>(&[], &env()).unwrap().step_names(), vec!["a"]);
    }

    #[test]
    fn group_members_wait_only_for_other_producers() {
        let s = scheduler(vec![
            noop_step("router").tags(["core"]).dependencies(["core"]),
            noop_step("pool").tags(["core"]),
        ]);
        assert_eq!(s.plan(&["core"], &env()).unwrap().step_names(), vec!["pool", "router"]);
    }

    #[test]
    fn cycle_outside_the_request_still_fails() {
        let s = scheduler(vec![
            noop_step("a").tags(["a"]).dependencies(["b"]),
            noop_step("b").tags(["b"]).dependencies(["a"]),
            noop_step("c").tags(["c"]),
        ]);
        let err = s.plan(&["c"], &env()).unwrap_err();
        assert!(matches!(err, DeployError::CyclicDependency { ref steps } if *steps == ["a", "b"]));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = Scheduler::new(vec![noop_step("a"), noop_step("a")]).unwrap_err();
        assert!(matches!(err, DeployError::DuplicateStep(ref n) if n == "a"));
    }

    #[tokio::test]
    async fn inapplicable_steps_keep_their_place_but_do_not_run() {
        let (ctx, ran) = recording_context();
        let s = scheduler(vec![
            crate::testing::recording_step("faucet", &ran)
                .tags(["funds"])
                .applicable_when(|env| !env.live),
            crate::testing::recording_step("pools", &ran).dependencies(["funds"]),
        ]);

        let live = env().live(true);
        let plan = s.plan::<&str>(&[], &live).unwrap();
        assert_eq!(plan.skipped(), vec!["faucet"]);

        let report = plan.execute(&ctx).await.unwrap();
        assert_eq!(report.executed, vec!["pools".to_string()]);
        assert_eq!(report.skipped, vec!["faucet".to_string()]);
        assert_eq!(*ran.lock(), vec!["pools".to_string()]);
    }

    #[tokio::test]
    async fn failure_stops_the_run() {
        let (ctx, ran) = recording_context();
        let s = scheduler(vec![
            crate::testing::recording_step("first", &ran),
            Step::new(
                "broken",
                step_fn(|_ctx| async { Err(DeployError::NotFound("Token".into())) }),
            ),
            crate::testing::recording_step("last", &ran),
        ]);

        let err = s.plan::<&str>(&[], &env()).unwrap().execute(&ctx).await.unwrap_err();
        assert!(matches!(err, DeployError::StepFailed { ref step, .. } if step == "broken"));
        assert!(matches!(err.root_cause(), DeployError::NotFound(_)));
        assert_eq!(*ran.lock(), vec!["first".to_string()]);
    }
}

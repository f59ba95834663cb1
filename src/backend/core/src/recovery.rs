//! Failure recovery.
//!
//! When a task settles as Failed, exactly one strategy decides what happens to
//! the tasks that depend on it. Strategies operate directly on the dependency
//! graph; the scheduler applies the resulting [`RecoveryOutcome`] to its own
//! bookkeeping (pending set, archive, persistence).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::dag::{DependencyGraph, Task, TaskId, TaskState};
use crate::error::{ConductorError, Result};

/// What to do with the dependents of a failed task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Cancel every task transitively blocked by the failed one
    #[default]
    CancelDependents,
    /// Grant another attempt if budget remains, else cancel dependents
    Retry,
    /// Drop the failed task from its dependents' prerequisites
    SkipAndContinue,
    /// Replace the failed task with one produced by a resolver
    Substitute,
    /// Run a compensation hook, then retry
    Rollback,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CancelDependents => "cancel_dependents",
            Self::Retry => "retry",
            Self::SkipAndContinue => "skip_and_continue",
            Self::Substitute => "substitute",
            Self::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// Produces a replacement for a failed task.
pub trait SubstituteResolver: Send + Sync {
    fn resolve(&self, failed: &Task) -> Option<Task>;
}

impl<F> SubstituteResolver for F
where
    F: Fn(&Task) -> Option<Task> + Send + Sync,
{
    fn resolve(&self, failed: &Task) -> Option<Task> {
        self(failed)
    }
}

/// Undoes the side effects of a failed task before it is retried.
#[async_trait]
pub trait CompensationHook: Send + Sync {
    async fn compensate(&self, failed: &Task) -> Result<()>;
}

/// Changes a strategy made to the graph.
#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    /// Strategy that was actually applied after fallbacks
    pub applied: Option<RecoveryStrategy>,
    /// The failed task went back to Queued
    pub requeued: bool,
    /// The failed task, removed from the graph (unless requeued)
    pub failed: Option<Task>,
    /// Dependents that were cancelled and removed from the graph
    pub cancelled: Vec<Task>,
    /// Dependents left with no prerequisites
    pub released: Vec<TaskId>,
    /// Replacement to submit; dependents already point at its id
    pub substitute: Option<Task>,
}

impl RecoveryOutcome {
    /// Ids of every task other than the failed one touched by recovery.
    pub fn affected(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.cancelled.iter().map(|t| t.id).collect();
        ids.extend(self.released.iter().copied());
        if let Some(substitute) = &self.substitute {
            ids.push(substitute.id);
        }
        ids
    }
}

/// Applies recovery strategies.
#[derive(Clone, Default)]
pub struct FailureRecovery {
    default_strategy: RecoveryStrategy,
    resolver: Option<Arc<dyn SubstituteResolver>>,
    compensation: Option<Arc<dyn CompensationHook>>,
}

impl fmt::Debug for FailureRecovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureRecovery")
            .field("default_strategy", &self.default_strategy)
            .field("resolver", &self.resolver.is_some())
            .field("compensation", &self.compensation.is_some())
            .finish()
    }
}

impl FailureRecovery {
    pub fn new(default_strategy: RecoveryStrategy) -> Self {
        Self {
            default_strategy,
            ..Self::default()
        }
    }

    pub fn with_resolver(mut self, resolver: impl SubstituteResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn with_compensation(mut self, hook: impl CompensationHook + 'static) -> Self {
        self.compensation = Some(Arc::new(hook));
        self
    }

    pub fn default_strategy(&self) -> RecoveryStrategy {
        self.default_strategy
    }

    /// Per-task override, else the configured default.
    pub fn strategy_for(&self, task: &Task) -> RecoveryStrategy {
        task.recovery.unwrap_or(self.default_strategy)
    }

    /// Run the compensation hook, if one is installed.
    pub async fn compensate(&self, failed: &Task) -> Result<()> {
        match &self.compensation {
            Some(hook) => hook.compensate(failed).await,
            None => Ok(()),
        }
    }

    /// Apply `strategy` to the failed task `failed_id`.
    pub fn apply(
        &self,
        graph: &mut DependencyGraph,
        failed_id: TaskId,
        strategy: RecoveryStrategy,
    ) -> Result<RecoveryOutcome> {
        let failed = graph
            .get(failed_id)
            .ok_or_else(|| ConductorError::task_not_found(failed_id))?;
        if failed.state() != TaskState::Failed {
            return Err(ConductorError::invalid_state_transition(failed.state(), TaskState::Failed));
        }

        match strategy {
            RecoveryStrategy::CancelDependents => Self::cancel_dependents(graph, failed_id),
            RecoveryStrategy::Retry | RecoveryStrategy::Rollback => {
                Self::retry(graph, failed_id, strategy)
            }
            RecoveryStrategy::SkipAndContinue => Ok(Self::skip(graph, failed_id)),
            RecoveryStrategy::Substitute => self.substitute(graph, failed_id),
        }
    }

    fn cancel_dependents(graph: &mut DependencyGraph, failed_id: TaskId) -> Result<RecoveryOutcome> {
        let dependents = graph.transitive_dependents(failed_id);
        let reason = format!("dependency {} failed", failed_id);

        for id in &dependents {
            if let Some(task) = graph.get_mut(*id) {
                if !task.state().is_terminal() {
                    task.cancel(reason.clone())?;
                }
            }
        }

        let cancelled = dependents.into_iter().filter_map(|id| graph.remove(id)).collect();

        Ok(RecoveryOutcome {
            applied: Some(RecoveryStrategy::CancelDependents),
            failed: graph.remove(failed_id),
            cancelled,
            ..Default::default()
        })
    }

    fn retry(
        graph: &mut DependencyGraph,
        failed_id: TaskId,
        strategy: RecoveryStrategy,
    ) -> Result<RecoveryOutcome> {
        let Some(task) = graph.get_mut(failed_id) else {
            return Err(ConductorError::task_not_found(failed_id));
        };

        if !task.can_retry() {
            tracing::debug!(task_id = %failed_id, "Retry budget exhausted, cancelling dependents");
            return Self::cancel_dependents(graph, failed_id);
        }

        task.record_retry();
        task.transition(TaskState::Queued)?;
        task.add_note(format!("re-queued by {} recovery", strategy));

        Ok(RecoveryOutcome {
            applied: Some(strategy),
            requeued: true,
            ..Default::default()
        })
    }

    fn skip(graph: &mut DependencyGraph, failed_id: TaskId) -> RecoveryOutcome {
        let dependents: Vec<TaskId> = graph
            .get(failed_id)
            .map(|t| t.blocks().iter().copied().collect())
            .unwrap_or_default();
        let mut released = Vec::new();

        for id in dependents {
            graph.remove_dependency(id, failed_id);
            if let Some(task) = graph.get_mut(id) {
                task.add_note(format!("skipped failed dependency {}", failed_id));
                if task.depends_on.is_empty() {
                    released.push(id);
                }
            }
        }

        RecoveryOutcome {
            applied: Some(RecoveryStrategy::SkipAndContinue),
            failed: graph.remove(failed_id),
            released,
            ..Default::default()
        }
    }

    fn substitute(&self, graph: &mut DependencyGraph, failed_id: TaskId) -> Result<RecoveryOutcome> {
        let replacement = match (&self.resolver, graph.get(failed_id)) {
            (Some(resolver), Some(failed)) => resolver.resolve(failed),
            _ => None,
        };
        let Some(mut replacement) = replacement else {
            tracing::debug!(task_id = %failed_id, "No substitute available, cancelling dependents");
            return Self::cancel_dependents(graph, failed_id);
        };

        let dependents: Vec<TaskId> = graph
            .get(failed_id)
            .map(|t| t.blocks().iter().copied().collect())
            .unwrap_or_default();
        // Rewire on a copy: one rejected edge must leave every dependent as it was.
        let mut staged = graph.clone();
        for id in &dependents {
            staged.replace_dependency(*id, failed_id, replacement.id)?;
        }
        *graph = staged;
        replacement.add_note(format!("substitute for failed task {}", failed_id));

        Ok(RecoveryOutcome {
            applied: Some(RecoveryStrategy::Substitute),
            failed: graph.remove(failed_id),
            substitute: Some(replacement),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::TaskKind;

    fn queued(name: &str) -> Task {
        let mut task = Task::new(name, TaskKind::SingleAgent);
        task.transition(TaskState::Queued).unwrap();
        task
    }

    fn failed(name: &str, max_retries: u32) -> Task {
        let mut task = queued(name).with_max_retries(max_retries);
        task.transition(TaskState::Ready).unwrap();
        task.transition(TaskState::Running).unwrap();
        task.fail("boom").unwrap();
        task
    }

    /// a (failed) <- b <- c, plus an unrelated task.
    fn chain(max_retries: u32) -> (DependencyGraph, TaskId, TaskId, TaskId, TaskId) {
        let mut graph = DependencyGraph::new();
        let a = graph.add(failed("a", max_retries)).unwrap();
        let b = graph.add(queued("b").with_dependency(a)).unwrap();
        let c = graph.add(queued("c").with_dependency(b)).unwrap();
        let x = graph.add(queued("x")).unwrap();
        (graph, a, b, c, x)
    }

    #[test]
    fn test_cancel_dependents_is_transitive() {
        let (mut graph, a, b, c, x) = chain(0);
        let outcome = FailureRecovery::default()
            .apply(&mut graph, a, RecoveryStrategy::CancelDependents)
            .unwrap();

        let cancelled: Vec<TaskId> = outcome.cancelled.iter().map(|t| t.id).collect();
        assert_eq!(cancelled.len(), 2);
        assert!(cancelled.contains(&b) && cancelled.contains(&c));
        assert!(outcome
            .cancelled
            .iter()
            .all(|t| t.state() == TaskState::Cancelled));
        assert_eq!(outcome.failed.unwrap().state(), TaskState::Failed);
        assert_eq!(graph.len(), 1);
        assert!(graph.contains(x));
    }

    #[test]
    fn test_retry_with_budget_requeues() {
        let (mut graph, a, b, _, _) = chain(2);
        let outcome = FailureRecovery::default()
            .apply(&mut graph, a, RecoveryStrategy::Retry)
            .unwrap();

        assert!(outcome.requeued);
        assert_eq!(graph.get(a).unwrap().state(), TaskState::Queued);
        assert_eq!(graph.get(a).unwrap().retry_count(), 1);
        assert!(graph.get(b).unwrap().depends_on.contains(&a));
    }

    #[test]
    fn test_retry_without_budget_cancels() {
        let (mut graph, a, _, _, _) = chain(0);
        let outcome = FailureRecovery::default()
            .apply(&mut graph, a, RecoveryStrategy::Retry)
            .unwrap();

        assert!(!outcome.requeued);
        assert_eq!(outcome.applied, Some(RecoveryStrategy::CancelDependents));
        assert_eq!(outcome.cancelled.len(), 2);
    }

    #[test]
    fn test_skip_and_continue_releases_dependent() {
        let (mut graph, a, b, c, _) = chain(0);
        let outcome = FailureRecovery::default()
            .apply(&mut graph, a, RecoveryStrategy::SkipAndContinue)
            .unwrap();

        assert_eq!(outcome.released, vec![b]);
        assert!(graph.get(b).unwrap().depends_on.is_empty());
        assert!(graph.ready_tasks().contains(&b));
        assert!(!graph.ready_tasks().contains(&c));
        assert!(!graph.contains(a));
    }

    #[test]
    fn test_substitute_rewires_dependents() {
        let (mut graph, a, b, _, _) = chain(0);
        let recovery = FailureRecovery::default().with_resolver(|failed: &Task| {
            Some(Task::new(format!("{}-retry", failed.name), failed.kind))
        });

        let outcome = recovery
            .apply(&mut graph, a, RecoveryStrategy::Substitute)
            .unwrap();

        let substitute = outcome.substitute.unwrap();
        assert_eq!(substitute.name, "a-retry");
        assert!(graph.get(b).unwrap().depends_on.contains(&substitute.id));
        assert!(!graph.get(b).unwrap().depends_on.contains(&a));
    }

    #[test]
    fn test_rejected_substitute_leaves_graph_untouched() {
        // a (failed) <- b, a <- d, and e depends on d. Pointing d at e closes
        // a cycle; b may already have been rewired by then.
        let mut graph = DependencyGraph::new();
        let a = graph.add(failed("a", 0)).unwrap();
        let b = graph.add(queued("b").with_dependency(a)).unwrap();
        let d = graph.add(queued("d").with_dependency(a)).unwrap();
        let e = graph.add(queued("e").with_dependency(d)).unwrap();
        let existing = graph.get(e).unwrap().clone();

        let recovery = FailureRecovery::default().with_resolver(move |_: &Task| Some(existing.clone()));
        let err = recovery
            .apply(&mut graph, a, RecoveryStrategy::Substitute)
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::CyclicDependency);

        assert!(graph.contains(a));
        for id in [b, d] {
            let task = graph.get(id).unwrap();
            assert!(task.depends_on.contains(&a));
            assert!(!task.depends_on.contains(&e));
        }
        assert_eq!(graph.get(a).unwrap().blocks(), &std::collections::BTreeSet::from([b, d]));
        assert!(graph.get(e).unwrap().blocks().is_empty());
        assert!(!graph.has_cycle());
    }

    #[test]
    fn test_substitute_without_resolver_cancels() {
        let (mut graph, a, _, _, _) = chain(0);
        let outcome = FailureRecovery::default()
            .apply(&mut graph, a, RecoveryStrategy::Substitute)
            .unwrap();

        assert_eq!(outcome.applied, Some(RecoveryStrategy::CancelDependents));
        assert_eq!(outcome.cancelled.len(), 2);
    }

    #[test]
    fn test_rejects_non_failed_task() {
        let mut graph = DependencyGraph::new();
        let id = graph.add(queued("ok")).unwrap();

        let err = FailureRecovery::default()
            .apply(&mut graph, id, RecoveryStrategy::CancelDependents)
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidStateTransition);
    }

    #[test]
    fn test_per_task_override() {
        let recovery = FailureRecovery::new(RecoveryStrategy::CancelDependents);
        let task = queued("t").with_recovery(RecoveryStrategy::SkipAndContinue);
        assert_eq!(recovery.strategy_for(&task), RecoveryStrategy::SkipAndContinue);
        assert_eq!(recovery.strategy_for(&queued("u")), RecoveryStrategy::CancelDependents);
    }

    struct CountingHook(Arc<std::sync::atomic::AtomicU32>);

    #[async_trait]
    impl CompensationHook for CountingHook {
        async fn compensate(&self, _failed: &Task) -> Result<()> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_compensation_hook_runs() {
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let recovery = FailureRecovery::default().with_compensation(CountingHook(calls.clone()));

        recovery.compensate(&queued("t")).await.unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}

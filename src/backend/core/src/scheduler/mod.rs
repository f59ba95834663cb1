//! Task queue: admission, priority dispatch, retry, cancellation.
//!
//! All queue state (dependency graph, pending set, running set, backoff timers,
//! settled archive) lives behind one mutex. Every mutation happens inside a
//! short critical section that never awaits; executor calls, backoff sleeps
//! and store writes run outside it.
//!
//! # Lifecycle of a task
//!
//! 1. `enqueue` resolves dependencies, adds the task to the graph, moves it to
//!    Queued, persists it and inserts it into the pending set.
//! 2. `dispatch` walks the pending set in priority order and starts every
//!    ready task that fits the concurrency bound, the rate limit and its
//!    kind's circuit breaker.
//! 3. On success the result is delivered to direct dependents, the task is
//!    interpreted, archived, and its follow-ups are enqueued.
//! 4. On a retryable failure with budget left the task waits out a backoff
//!    delay in Failed, then returns to Queued. Otherwise failure recovery
//!    decides the fate of its dependents.

mod circuit;
mod events;
mod rate_limit;
mod retry;

pub use circuit::{Admission, CircuitBreakerConfig, CircuitState, KindBreakers};
pub use events::TaskEvent;
pub use rate_limit::{RateLimitConfig, RateLimitError, RateLimiter};
pub use retry::RetryPolicy;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dag::{DependencyGraph, Priority, Task, TaskId, TaskKind, TaskState};
use crate::error::{ConductorError, Result};
use crate::executor::{ExecutionContext, ExecutionError, Executor, ExecutorRegistry};
use crate::interpreter::{FollowUp, InterpreterRegistry};
use crate::recovery::{FailureRecovery, RecoveryOutcome, RecoveryStrategy};
use crate::store::{MemoryStore, PersistenceWriter, TaskStore};
use crate::telemetry::metrics::TaskMetrics;
use crate::telemetry::redact_parameters;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum tasks running at once (composite coordinators excluded)
    pub max_concurrency: usize,

    /// Retry budget for tasks built from plans and `Orchestrator::task`
    pub default_max_retries: u32,

    /// Attempt timeout for tasks that set none
    #[serde(with = "humantime_serde")]
    pub default_timeout: Option<Duration>,

    /// Capacity of the event broadcast channel
    pub event_buffer: usize,

    /// Strategy for tasks without their own
    pub recovery_strategy: RecoveryStrategy,

    pub retry: RetryPolicy,

    pub circuit_breaker: CircuitBreakerConfig,

    /// How long shutdown waits for running tasks
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            default_max_retries: 3,
            default_timeout: None,
            event_buffer: 1024,
            recovery_strategy: RecoveryStrategy::CancelDependents,
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Tasks in Queued, including those waiting on dependencies
    pub queued: usize,
    pub running: usize,
    /// Failed tasks waiting out a backoff delay
    pub waiting_retry: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries: u64,
    pub concurrency_limit: usize,
    pub accepting: bool,
    pub persistence_failures: u64,
    /// Snapshots queued for the store but not yet written
    pub persistence_backlog: u64,
    pub last_persistence_error: Option<String>,
    pub open_circuits: Vec<TaskKind>,
}

/// Result of re-admitting tasks loaded from the store.
#[derive(Debug, Default)]
pub struct RecoveredAdmission {
    pub admitted: Vec<TaskId>,
    pub rejected: Vec<(TaskId, ConductorError)>,
    /// Admitted tasks cancelled because a prerequisite never came back
    pub orphaned: Vec<TaskId>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queue State
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct RunningTask {
    attempt: u32,
    cancellation: CancellationToken,
    occupies_slot: bool,
    /// Admitted as a half-open breaker trial
    trial: bool,
}

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    failed: u64,
    cancelled: u64,
    retries: u64,
}

struct SchedulerState {
    graph: DependencyGraph,
    pending: BTreeSet<(Priority, u64, TaskId)>,
    pending_index: HashMap<TaskId, (Priority, u64)>,
    next_seq: u64,
    running: HashMap<TaskId, RunningTask>,
    slots_in_use: usize,
    backoff: HashMap<TaskId, CancellationToken>,
    archive: HashMap<TaskId, Task>,
    breakers: KindBreakers,
    counters: Counters,
    wake_at: Option<Instant>,
    accepting: bool,
    dispatching: bool,
}

impl SchedulerState {
    fn new(config: &SchedulerConfig) -> Self {
        Self {
            graph: DependencyGraph::new(),
            pending: BTreeSet::new(),
            pending_index: HashMap::new(),
            next_seq: 0,
            running: HashMap::new(),
            slots_in_use: 0,
            backoff: HashMap::new(),
            archive: HashMap::new(),
            breakers: KindBreakers::new(config.circuit_breaker.clone()),
            counters: Counters::default(),
            wake_at: None,
            accepting: true,
            dispatching: true,
        }
    }

    fn push_pending(&mut self, task_id: TaskId, priority: Priority) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert((priority, seq, task_id));
        self.pending_index.insert(task_id, (priority, seq));
    }

    fn remove_pending(&mut self, task_id: TaskId) {
        if let Some((priority, seq)) = self.pending_index.remove(&task_id) {
            self.pending.remove(&(priority, seq, task_id));
        }
    }

    /// Drop the running entry for `attempt`. False if the attempt is stale.
    fn release(&mut self, task_id: TaskId, attempt: u32) -> bool {
        if self.running.get(&task_id).map(|r| r.attempt) != Some(attempt) {
            return false;
        }
        if let Some(run) = self.running.remove(&task_id) {
            if run.occupies_slot {
                self.slots_in_use = self.slots_in_use.saturating_sub(1);
            }
        }
        true
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty() && self.backoff.is_empty()
    }

    fn state_of(&self, task_id: TaskId) -> Option<TaskState> {
        self.graph
            .get(task_id)
            .or_else(|| self.archive.get(&task_id))
            .map(Task::state)
    }
}

struct QueueInner {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    executors: ExecutorRegistry,
    interpreters: InterpreterRegistry,
    recovery: FailureRecovery,
    limiter: RateLimiter,
    store: Arc<dyn TaskStore>,
    writer: PersistenceWriter,
    events: broadcast::Sender<TaskEvent>,
    settled: Notify,
    closed: CancellationToken,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder for [`TaskQueue`].
pub struct TaskQueueBuilder {
    config: SchedulerConfig,
    executors: ExecutorRegistry,
    interpreters: InterpreterRegistry,
    recovery: Option<FailureRecovery>,
    limiter: RateLimiter,
    store: Arc<dyn TaskStore>,
    write_attempts: u32,
}

impl Default for TaskQueueBuilder {
    fn default() -> Self {
        Self {
            config: SchedulerConfig::default(),
            executors: ExecutorRegistry::new(),
            interpreters: InterpreterRegistry::default(),
            recovery: None,
            limiter: RateLimiter::unlimited(),
            store: Arc::new(MemoryStore::new()),
            write_attempts: 3,
        }
    }
}

impl TaskQueueBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.config.max_concurrency = max_concurrency;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn executor(mut self, kind: TaskKind, executor: Arc<dyn Executor>) -> Self {
        self.executors.register(kind, executor);
        self
    }

    pub fn interpreters(mut self, interpreters: InterpreterRegistry) -> Self {
        self.interpreters = interpreters;
        self
    }

    /// Overrides `config.recovery_strategy` and installs resolver/compensation hooks.
    pub fn recovery(mut self, recovery: FailureRecovery) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = store;
        self
    }

    pub fn write_attempts(mut self, attempts: u32) -> Self {
        self.write_attempts = attempts;
        self
    }

    /// Build the queue. Must be called within a Tokio runtime.
    pub fn build(self) -> TaskQueue {
        let (events, _) = broadcast::channel(self.config.event_buffer.max(1));
        let writer = PersistenceWriter::spawn(self.store.clone(), self.write_attempts, events.clone());
        let recovery = self
            .recovery
            .unwrap_or_else(|| FailureRecovery::new(self.config.recovery_strategy));

        TaskQueue {
            inner: Arc::new(QueueInner {
                state: Mutex::new(SchedulerState::new(&self.config)),
                config: self.config,
                executors: self.executors,
                interpreters: self.interpreters,
                recovery,
                limiter: self.limiter,
                store: self.store,
                writer,
                events,
                settled: Notify::new(),
                closed: CancellationToken::new(),
            }),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared handle to the task queue. Cloning is cheap.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("status", &self.queue_status())
            .finish()
    }
}

impl TaskQueue {
    pub fn builder() -> TaskQueueBuilder {
        TaskQueueBuilder::default()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Admission
    // ─────────────────────────────────────────────────────────────────────────

    /// Admit a task in the Created state and try to dispatch.
    ///
    /// Every dependency must be active in the queue or already settled. A
    /// dependency that completed is treated as satisfied and its result is
    /// delivered into `context.upstream`; one that failed or was cancelled
    /// rejects the task with `DependencyNotMet`.
    pub fn enqueue(&self, task: Task) -> Result<TaskId> {
        let task_id = {
            let mut state = self.inner.state.lock();
            self.admit_locked(&mut state, task)?
        };
        self.dispatch();
        Ok(task_id)
    }

    fn admit_locked(&self, state: &mut SchedulerState, mut task: Task) -> Result<TaskId> {
        if !state.accepting {
            return Err(ConductorError::queue_closed());
        }
        if task.state() != TaskState::Created {
            return Err(ConductorError::invalid_state_transition(task.state(), TaskState::Queued));
        }
        if state.graph.contains(task.id) || state.archive.contains_key(&task.id) {
            return Err(ConductorError::task_already_exists(task.id));
        }
        if task.depends_on.contains(&task.id) {
            return Err(ConductorError::cyclic_dependency(task.id));
        }

        let dependencies: Vec<TaskId> = task.depends_on.iter().copied().collect();
        for dep in dependencies {
            if state.graph.contains(dep) {
                continue;
            }
            match state.archive.get(&dep) {
                Some(settled) if settled.state() == TaskState::Completed => {
                    let result = settled.result().cloned().unwrap_or(Value::Null);
                    task.depends_on.remove(&dep);
                    task.record_upstream(dep, result);
                }
                Some(settled) => {
                    return Err(ConductorError::dependency_not_met(task.id, dep, settled.state()));
                }
                None => return Err(ConductorError::task_not_found(dep)),
            }
        }

        self.insert_locked(state, task)
    }

    /// Queued, into the graph, persisted, pending.
    fn insert_locked(&self, state: &mut SchedulerState, mut task: Task) -> Result<TaskId> {
        task.transition(TaskState::Queued)?;
        let (kind, priority, parent) = (task.kind, task.priority, task.parent_id);
        let task_id = state.graph.add(task)?;

        if let Some(parent_id) = parent {
            if let Some(parent) = state.graph.get_mut(parent_id) {
                if !parent.children.contains(&task_id) {
                    parent.children.push(task_id);
                }
                self.inner.writer.save(parent);
            }
        }

        state.push_pending(task_id, priority);
        if let Some(task) = state.graph.get(task_id) {
            self.inner.writer.save(task);
            tracing::debug!(
                task_id = %task_id,
                name = %task.name,
                kind = %kind,
                priority = ?priority,
                dependencies = task.depends_on.len(),
                "Task enqueued"
            );
        }
        TaskMetrics::submitted(kind);
        self.emit(TaskEvent::Submitted {
            task_id,
            kind,
            priority,
        });
        Ok(task_id)
    }

    /// Re-admit tasks loaded from the store after a restart.
    ///
    /// Tasks must be in Created (see `Task::reset_for_recovery`). Dependencies
    /// may reference each other in any order; a task whose prerequisite is not
    /// among the admitted tasks is cancelled.
    pub fn admit_recovered(&self, tasks: Vec<Task>) -> RecoveredAdmission {
        let mut report = RecoveredAdmission::default();
        {
            let mut state = self.inner.state.lock();
            for task in tasks {
                let task_id = task.id;
                let admitted = if state.accepting {
                    self.insert_locked(&mut state, task)
                } else {
                    Err(ConductorError::queue_closed())
                };
                match admitted {
                    Ok(id) => report.admitted.push(id),
                    Err(e) => report.rejected.push((task_id, e)),
                }
            }

            let orphans: Vec<TaskId> = report
                .admitted
                .iter()
                .copied()
                .filter(|id| {
                    state.graph.get(*id).is_some_and(|task| {
                        task.depends_on.iter().any(|dep| !state.graph.contains(*dep))
                    })
                })
                .collect();
            if !orphans.is_empty() {
                report.orphaned =
                    self.cancel_cascade_locked(&mut state, orphans, "prerequisite missing after restart");
            }
        }
        self.dispatch();
        report
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────────

    /// Start every ready task that fits the concurrency bound, the rate limit
    /// and its kind's circuit breaker, highest priority first.
    pub fn dispatch(&self) {
        let mut launches: Vec<(Task, u32, CancellationToken)> = Vec::new();
        let mut wake_in: Option<Duration> = None;
        let timer;
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            if state.is_idle() {
                self.inner.settled.notify_waiters();
            }
            if !state.dispatching || state.pending.is_empty() {
                return;
            }

            let ready: HashSet<TaskId> = state.graph.ready_tasks().into_iter().collect();
            let candidates: Vec<(Priority, u64, TaskId)> = state
                .pending
                .iter()
                .filter(|(_, _, id)| ready.contains(id))
                .copied()
                .collect();

            let mut rate_limited = false;
            let mut blocked: HashSet<TaskKind> = HashSet::new();

            for (_, _, task_id) in candidates {
                let Some(kind) = state.graph.get(task_id).map(|t| t.kind) else {
                    continue;
                };
                let occupies_slot = kind.occupies_slot();

                if occupies_slot {
                    if rate_limited || state.slots_in_use >= self.inner.config.max_concurrency {
                        continue;
                    }
                    if let Err(limited) = self.inner.limiter.check() {
                        rate_limited = true;
                        wake_in = earliest(wake_in, limited.retry_after());
                        continue;
                    }
                }
                if blocked.contains(&kind) {
                    continue;
                }
                if let Admission::Blocked { retry_after } = state.breakers.admit(kind) {
                    blocked.insert(kind);
                    if let Some(delay) = retry_after {
                        wake_in = earliest(wake_in, delay);
                    }
                    continue;
                }
                let trial = state.breakers.has_trial_in_flight(kind);
                if occupies_slot {
                    if let Err(limited) = self.inner.limiter.try_acquire() {
                        if trial {
                            state.breakers.release_trial(kind);
                        }
                        rate_limited = true;
                        wake_in = earliest(wake_in, limited.retry_after());
                        continue;
                    }
                }

                let Some(task) = state.graph.get_mut(task_id) else {
                    continue;
                };
                if let Err(e) = task
                    .transition(TaskState::Ready)
                    .and_then(|_| task.transition(TaskState::Running))
                {
                    tracing::error!(task_id = %task_id, error = %e, "Ready task could not start");
                    continue;
                }
                let attempt = task.retry_count() + 1;
                let cancellation = CancellationToken::new();
                self.inner.writer.save(task);
                launches.push((task.clone(), attempt, cancellation.clone()));

                state.remove_pending(task_id);
                state.running.insert(
                    task_id,
                    RunningTask {
                        attempt,
                        cancellation,
                        occupies_slot,
                        trial,
                    },
                );
                if occupies_slot {
                    state.slots_in_use += 1;
                }
            }

            timer = wake_in.and_then(|delay| {
                let deadline = Instant::now() + delay;
                match state.wake_at {
                    Some(armed) if armed <= deadline => None,
                    _ => {
                        state.wake_at = Some(deadline);
                        Some(deadline)
                    }
                }
            });

            TaskMetrics::depth(state.pending.len(), state.running.len());
        }

        for (task, attempt, cancellation) in launches {
            TaskMetrics::started(task.kind);
            self.emit(TaskEvent::Started {
                task_id: task.id,
                attempt,
            });
            tokio::spawn(self.clone().run_task(task, attempt, cancellation));
        }

        if let Some(deadline) = timer {
            let queue = self.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = queue.inner.closed.cancelled() => return,
                }
                {
                    let mut state = queue.inner.state.lock();
                    if state.wake_at == Some(deadline) {
                        state.wake_at = None;
                    }
                }
                queue.dispatch();
            });
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────

    async fn run_task(self, task: Task, attempt: u32, cancellation: CancellationToken) {
        let executor = self.inner.executors.get(task.kind);
        let ctx = ExecutionContext::new(task.id, attempt, cancellation.child_token(), self.clone());
        let timeout = task.timeout.or(self.inner.config.default_timeout);
        let started = Instant::now();

        tracing::info!(
            task_id = %task.id,
            name = %task.name,
            kind = %task.kind,
            attempt,
            executor = executor.name(),
            "Task started"
        );
        tracing::debug!(
            task_id = %task.id,
            parameters = %redact_parameters(&task.parameters),
            "Task parameters"
        );

        let outcome = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                tracing::debug!(task_id = %task.id, attempt, "Attempt abandoned after cancellation");
                return;
            }
            outcome = Self::execute(executor.as_ref(), &task, &ctx, timeout) => outcome,
        };

        TaskMetrics::attempt_finished(task.kind, outcome.is_ok(), started.elapsed());
        match outcome {
            Ok(result) => self.on_success(task.id, attempt, result),
            Err(error) => self.on_failure(task.id, attempt, error).await,
        }
        self.dispatch();
    }

    async fn execute(
        executor: &dyn Executor,
        task: &Task,
        ctx: &ExecutionContext,
        timeout: Option<Duration>,
    ) -> std::result::Result<Value, ExecutionError> {
        let call = AssertUnwindSafe(executor.execute(task, ctx)).catch_unwind();
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(ExecutionError::timeout(limit)),
            },
            None => call.await,
        };
        outcome.unwrap_or_else(|_| Err(ExecutionError::fatal(format!("executor {} panicked", executor.name()))))
    }

    fn on_success(&self, task_id: TaskId, attempt: u32, result: Value) {
        let follow_ups: Vec<FollowUp>;
        {
            let mut state = self.inner.state.lock();
            if !state.release(task_id, attempt) {
                return;
            }
            self.inner.settled.notify_waiters();

            let Some(task) = state.graph.get_mut(task_id) else {
                return;
            };
            if let Err(e) = task.complete(result.clone()) {
                tracing::error!(task_id = %task_id, error = %e, "Could not record task result");
                return;
            }
            let kind = task.kind;

            follow_ups = match self.inner.interpreters.interpret(task) {
                Some(verdict) => {
                    task.add_tag(format!("outcome:{}", verdict.outcome));
                    if let Some(summary) = &verdict.summary {
                        task.add_note(summary.clone());
                    }
                    self.inner.interpreters.follow_ups(task, &verdict)
                }
                None => Vec::new(),
            };

            let dependents: Vec<TaskId> = task.blocks().iter().copied().collect();
            for dependent in dependents {
                if let Some(t) = state.graph.get_mut(dependent) {
                    t.record_upstream(task_id, result.clone());
                    self.inner.writer.save(t);
                }
            }

            state.breakers.record_success(kind);
            if let Some(task) = state.graph.remove(task_id) {
                state.counters.completed += 1;
                self.inner.writer.save(&task);
                tracing::info!(
                    task_id = %task_id,
                    name = %task.name,
                    kind = %kind,
                    execution_ms = task.metadata.execution_ms,
                    "Task completed"
                );
                state.archive.insert(task_id, task);
            }
            TaskMetrics::completed(kind);
            self.emit(TaskEvent::Completed { task_id, result });
        }

        for follow_up in follow_ups {
            let FollowUp { suggestion, task } = follow_up;
            match self.enqueue(task) {
                Ok(id) => {
                    TaskMetrics::follow_up(&suggestion);
                    tracing::info!(origin = %task_id, task_id = %id, suggestion = %suggestion, "Follow-up enqueued");
                    self.emit(TaskEvent::FollowUp {
                        origin: task_id,
                        task_id: id,
                        suggestion,
                    });
                }
                Err(e) => {
                    tracing::warn!(origin = %task_id, suggestion = %suggestion, error = %e, "Follow-up rejected");
                }
            }
        }
    }

    async fn on_failure(&self, task_id: TaskId, attempt: u32, error: ExecutionError) {
        let strategy = {
            let mut state = self.inner.state.lock();
            if !state.release(task_id, attempt) {
                return;
            }
            self.inner.settled.notify_waiters();

            let Some(task) = state.graph.get_mut(task_id) else {
                return;
            };
            if let Err(e) = task.fail(error.message.clone()) {
                tracing::error!(task_id = %task_id, error = %e, "Could not record task failure");
                return;
            }
            let kind = task.kind;

            if error.retryable && task.can_retry() {
                let delay = self.inner.config.retry.delay_for_attempt(task.retry_count());
                task.record_retry();
                task.add_note(format!("attempt {} failed: {}", attempt, error.message));
                self.inner.writer.save(task);
                tracing::warn!(
                    task_id = %task_id,
                    kind = %kind,
                    attempt,
                    retry_count = task.retry_count(),
                    max_retries = task.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Task attempt failed, retry scheduled"
                );

                let timer = CancellationToken::new();
                state.backoff.insert(task_id, timer.clone());
                state.counters.retries += 1;
                state.breakers.record_failure(kind);
                TaskMetrics::retried(kind);
                self.emit(TaskEvent::RetryScheduled {
                    task_id,
                    attempt,
                    delay,
                    error: error.message,
                });

                let queue = self.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = timer.cancelled() => {}
                        _ = tokio::time::sleep(delay) => queue.requeue(task_id),
                    }
                });
                return;
            }

            let strategy = self.inner.recovery.strategy_for(task);
            tracing::error!(
                task_id = %task_id,
                name = %task.name,
                kind = %kind,
                attempt,
                retryable = error.retryable,
                error = %error,
                strategy = %strategy,
                "Task failed"
            );
            state.breakers.record_failure(kind);
            strategy
        };

        self.recover_failure(task_id, strategy).await;
    }

    /// Failed -> Queued once a backoff delay elapses.
    fn requeue(&self, task_id: TaskId) {
        {
            let mut state = self.inner.state.lock();
            if state.backoff.remove(&task_id).is_none() {
                return;
            }
            let Some(task) = state.graph.get_mut(task_id) else {
                return;
            };
            if let Err(e) = task.transition(TaskState::Queued) {
                tracing::error!(task_id = %task_id, error = %e, "Could not re-queue task");
                return;
            }
            let priority = task.priority;
            self.inner.writer.save(task);
            state.push_pending(task_id, priority);
            tracing::debug!(task_id = %task_id, "Task re-queued after backoff");
        }
        self.dispatch();
    }

    async fn recover_failure(&self, task_id: TaskId, strategy: RecoveryStrategy) {
        if strategy == RecoveryStrategy::Rollback {
            let snapshot = self.inner.state.lock().graph.get(task_id).cloned();
            if let Some(failed) = snapshot {
                if let Err(e) = self.inner.recovery.compensate(&failed).await {
                    tracing::warn!(task_id = %task_id, error = %e, "Compensation hook failed");
                }
            }
        }

        let substitute = {
            let mut state = self.inner.state.lock();
            // Cancelled while compensating.
            if state.graph.get(task_id).map(Task::state) != Some(TaskState::Failed) {
                return;
            }
            let outcome = match self.inner.recovery.apply(&mut state.graph, task_id, strategy) {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "Failure recovery could not be applied");
                    return;
                }
            };
            self.apply_recovery_locked(&mut state, task_id, outcome)
        };

        if let Some(substitute) = substitute {
            let substitute_id = substitute.id;
            if let Err(e) = self.enqueue(substitute) {
                tracing::error!(task_id = %task_id, substitute = %substitute_id, error = %e, "Substitute rejected");
                let mut state = self.inner.state.lock();
                let waiting: Vec<TaskId> = state
                    .graph
                    .tasks()
                    .filter(|t| t.depends_on.contains(&substitute_id))
                    .map(|t| t.id)
                    .collect();
                self.cancel_cascade_locked(&mut state, waiting, "substitute task was rejected");
            }
        }
    }

    fn apply_recovery_locked(
        &self,
        state: &mut SchedulerState,
        failed_id: TaskId,
        outcome: RecoveryOutcome,
    ) -> Option<Task> {
        let affected = outcome.affected();
        let applied = outcome.applied.unwrap_or(RecoveryStrategy::CancelDependents);
        let reason = format!("dependency {} failed", failed_id);

        if let Some(failed) = outcome.failed {
            let error = failed.error().unwrap_or_default().to_string();
            state.counters.failed += 1;
            TaskMetrics::failed(failed.kind);
            self.inner.writer.save(&failed);
            state.archive.insert(failed_id, failed);
            self.emit(TaskEvent::Failed {
                task_id: failed_id,
                error,
            });
        }

        if outcome.requeued {
            if let Some(task) = state.graph.get(failed_id) {
                let priority = task.priority;
                self.inner.writer.save(task);
                state.push_pending(failed_id, priority);
            }
        }

        for cancelled in outcome.cancelled {
            let id = cancelled.id;
            state.remove_pending(id);
            state.counters.cancelled += 1;
            TaskMetrics::cancelled(cancelled.kind);
            self.inner.writer.save(&cancelled);
            state.archive.insert(id, cancelled);
            self.emit(TaskEvent::Cancelled {
                task_id: id,
                reason: reason.clone(),
            });
        }

        for released in &outcome.released {
            if let Some(task) = state.graph.get(*released) {
                self.inner.writer.save(task);
            }
        }

        tracing::info!(
            task_id = %failed_id,
            strategy = %applied,
            affected = affected.len(),
            "Failure recovery applied"
        );
        self.emit(TaskEvent::Recovered {
            task_id: failed_id,
            strategy: applied,
            affected,
        });

        outcome.substitute
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cancellation
    // ─────────────────────────────────────────────────────────────────────────

    /// Cancel a task, its transitive dependents and its composite children.
    pub fn cancel(&self, task_id: TaskId) -> Result<()> {
        self.cancel_with_reason(task_id, "cancelled by caller")
    }

    pub fn cancel_with_reason(&self, task_id: TaskId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        {
            let mut state = self.inner.state.lock();
            if !state.graph.contains(task_id) {
                return Err(match state.archive.get(&task_id) {
                    Some(settled) => {
                        ConductorError::invalid_state_transition(settled.state(), TaskState::Cancelled)
                    }
                    None => ConductorError::task_not_found(task_id),
                });
            }
            self.cancel_cascade_locked(&mut state, vec![task_id], &reason);
        }
        self.dispatch();
        Ok(())
    }

    /// Cancel `roots` and everything reachable through `blocks` and `children`.
    fn cancel_cascade_locked(
        &self,
        state: &mut SchedulerState,
        roots: Vec<TaskId>,
        reason: &str,
    ) -> Vec<TaskId> {
        let root_set: HashSet<TaskId> = roots.iter().copied().collect();
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut work: VecDeque<TaskId> = roots.into();

        while let Some(id) = work.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let Some(task) = state.graph.get(id) else {
                continue;
            };
            order.push(id);
            work.extend(task.blocks().iter().copied());
            work.extend(task.children.iter().copied());
        }

        for id in &order {
            if let Some(run) = state.running.remove(id) {
                run.cancellation.cancel();
                if run.occupies_slot {
                    state.slots_in_use = state.slots_in_use.saturating_sub(1);
                }
                if run.trial {
                    if let Some(kind) = state.graph.get(*id).map(|t| t.kind) {
                        state.breakers.release_trial(kind);
                    }
                }
            }
            if let Some(timer) = state.backoff.remove(id) {
                timer.cancel();
            }
            state.remove_pending(*id);

            let note = if root_set.contains(id) {
                reason.to_string()
            } else {
                format!("upstream cancellation: {}", reason)
            };
            if let Some(task) = state.graph.get_mut(*id) {
                if let Err(e) = task.cancel(note) {
                    tracing::warn!(task_id = %id, error = %e, "Task could not be cancelled");
                }
            }
        }

        for id in &order {
            if let Some(task) = state.graph.remove(*id) {
                state.counters.cancelled += 1;
                TaskMetrics::cancelled(task.kind);
                self.inner.writer.save(&task);
                tracing::info!(task_id = %id, name = %task.name, reason = %reason, "Task cancelled");
                state.archive.insert(*id, task);
                self.emit(TaskEvent::Cancelled {
                    task_id: *id,
                    reason: reason.to_string(),
                });
            }
        }
        self.inner.settled.notify_waiters();

        order
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Current state of an active or settled task.
    pub fn status(&self, task_id: TaskId) -> Option<TaskState> {
        self.inner.state.lock().state_of(task_id)
    }

    /// Snapshot of an active or settled task.
    pub fn task(&self, task_id: TaskId) -> Option<Task> {
        let state = self.inner.state.lock();
        state
            .graph
            .get(task_id)
            .or_else(|| state.archive.get(&task_id))
            .cloned()
    }

    /// Like [`task`](Self::task), falling back to the store for pruned records.
    pub async fn load(&self, task_id: TaskId) -> Result<Option<Task>> {
        if let Some(task) = self.task(task_id) {
            return Ok(Some(task));
        }
        self.inner.store.load(task_id).await
    }

    pub fn queue_status(&self) -> QueueStatus {
        let state = self.inner.state.lock();
        let health = self.inner.writer.health();
        QueueStatus {
            queued: state.pending.len(),
            running: state.running.len(),
            waiting_retry: state.backoff.len(),
            completed: state.counters.completed,
            failed: state.counters.failed,
            cancelled: state.counters.cancelled,
            retries: state.counters.retries,
            concurrency_limit: self.inner.config.max_concurrency,
            accepting: state.accepting,
            persistence_failures: health.failures(),
            persistence_backlog: health.backlog(),
            last_persistence_error: health.last_error(),
            open_circuits: state.breakers.tripped(),
        }
    }

    /// Graphviz rendering of the active tasks.
    pub fn graph_dot(&self) -> String {
        self.inner.state.lock().graph.to_dot()
    }

    /// No task pending, running, or waiting to retry.
    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().is_idle()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Resolve once `task_id` settles (Completed, Failed or Cancelled).
    pub async fn wait_for(&self, task_id: TaskId) -> Result<Task> {
        let mut events = self.subscribe();
        loop {
            {
                let state = self.inner.state.lock();
                if let Some(task) = state.archive.get(&task_id) {
                    return Ok(task.clone());
                }
                if !state.graph.contains(task_id) {
                    return Err(ConductorError::task_not_found(task_id));
                }
            }

            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = self.inner.closed.cancelled() => return Err(ConductorError::queue_closed()),
                };
                match event {
                    Ok(event) if event.task_id() == task_id && event.settled_state().is_some() => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return Err(ConductorError::queue_closed()),
                }
            }
        }
    }

    /// Resolve once nothing is pending, running or waiting to retry.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.settled.notified();
            if self.is_idle() || self.inner.closed.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.inner.closed.cancelled() => return,
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Drop settled tasks older than `older_than` from memory. Their store
    /// records are kept.
    pub fn prune_archive(&self, older_than: Duration) -> usize {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut state = self.inner.state.lock();
        let before = state.archive.len();
        state.archive.retain(|_, task| {
            task.metadata.completed_at.unwrap_or(task.metadata.created_at) > cutoff
        });
        before - state.archive.len()
    }

    /// Wait until every queued store write has been applied.
    pub async fn flush(&self) -> Result<()> {
        self.inner.writer.flush().await
    }

    /// Stop admitting and dispatching, give running tasks `grace` to finish,
    /// then abandon the rest. Abandoned tasks stay Running in the store and
    /// are picked up by crash recovery on the next start.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            state.accepting = false;
            state.dispatching = false;
            tracing::info!(
                running = state.running.len(),
                queued = state.pending.len(),
                grace_ms = grace.as_millis() as u64,
                "Task queue shutting down"
            );
        }

        let deadline = Instant::now() + grace;
        loop {
            let notified = self.inner.settled.notified();
            if self.inner.state.lock().running.is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        {
            let mut state = self.inner.state.lock();
            for (task_id, run) in state.running.drain() {
                run.cancellation.cancel();
                tracing::warn!(task_id = %task_id, "Task still running at shutdown, abandoned");
            }
            state.slots_in_use = 0;
            for (_, timer) in state.backoff.drain() {
                timer.cancel();
            }
        }
        self.inner.closed.cancel();
        self.inner.writer.flush().await
    }

    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

fn earliest(current: Option<Duration>, candidate: Duration) -> Option<Duration> {
    Some(current.map_or(candidate, |c| c.min(candidate)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::from_fn;
    use serde_json::json;

    fn echo() -> Arc<dyn Executor> {
        from_fn(|task, _ctx| async move { Ok(json!({ "name": task.name })) })
    }

    fn queue() -> TaskQueue {
        TaskQueue::builder()
            .executor(TaskKind::SingleAgent, echo())
            .build()
    }

    #[tokio::test]
    async fn test_enqueue_runs_to_completion() {
        let queue = queue();
        let id = queue.enqueue(Task::new("hello", TaskKind::SingleAgent)).unwrap();

        let task = queue.wait_for(id).await.unwrap();
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(task.result(), Some(&json!({"name": "hello"})));
        assert!(task.metadata.tags.contains("outcome:success"));

        let status = queue.queue_status();
        assert_eq!(status.completed, 1);
        assert_eq!(status.running, 0);
    }

    #[tokio::test]
    async fn test_rejects_non_created_task() {
        let queue = queue();
        let mut task = Task::new("stale", TaskKind::SingleAgent);
        task.transition(TaskState::Queued).unwrap();
        assert!(queue.enqueue(task).is_err());
    }

    #[tokio::test]
    async fn test_unknown_dependency() {
        let queue = queue();
        let err = queue
            .enqueue(Task::new("orphan", TaskKind::SingleAgent).with_dependency(TaskId::new()))
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::TaskNotFound);
    }

    #[tokio::test]
    async fn test_settled_dependencies() {
        let queue = queue();
        let done = queue.enqueue(Task::new("done", TaskKind::SingleAgent)).unwrap();
        queue.wait_for(done).await.unwrap();

        let late = queue
            .enqueue(Task::new("late", TaskKind::SingleAgent).with_dependency(done))
            .unwrap();
        let late = queue.wait_for(late).await.unwrap();
        assert_eq!(late.state(), TaskState::Completed);
        assert_eq!(late.upstream_result(done), Some(&json!({"name": "done"})));

        let blocked = queue
            .enqueue(Task::new("blocked", TaskKind::Analysis).with_dependency(done))
            .unwrap();
        queue.cancel(blocked).unwrap();
        let err = queue
            .enqueue(Task::new("after-cancel", TaskKind::SingleAgent).with_dependency(blocked))
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::DependencyNotMet);
    }

    #[tokio::test]
    async fn test_cancel_settled_task_fails() {
        let queue = queue();
        let id = queue.enqueue(Task::new("quick", TaskKind::SingleAgent)).unwrap();
        queue.wait_for(id).await.unwrap();

        let err = queue.cancel(id).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidStateTransition);
        assert_eq!(
            queue.cancel(TaskId::new()).unwrap_err().code(),
            crate::error::ErrorCode::TaskNotFound
        );
    }

    #[tokio::test]
    async fn test_unconfigured_kind_fails_without_retry() {
        let queue = queue();
        let id = queue
            .enqueue(Task::new("nobody home", TaskKind::Swarm).with_max_retries(3))
            .unwrap();
        let task = queue.wait_for(id).await.unwrap();
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(task.retry_count(), 0);
        assert!(task.error().unwrap().contains("no executor registered"));
    }

    #[tokio::test]
    async fn test_panicking_executor_fails_task() {
        let queue = TaskQueue::builder()
            .executor(
                TaskKind::SingleAgent,
                from_fn(|_task, _ctx| async move {
                    if true {
                        panic!("executor bug");
                    }
                    Ok(Value::Null)
                }),
            )
            .build();

        let id = queue.enqueue(Task::new("boom", TaskKind::SingleAgent)).unwrap();
        let task = queue.wait_for(id).await.unwrap();
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(queue.queue_status().running, 0);
    }

    #[tokio::test]
    async fn test_prune_archive() {
        let queue = queue();
        let id = queue.enqueue(Task::new("old", TaskKind::SingleAgent)).unwrap();
        queue.wait_for(id).await.unwrap();

        assert_eq!(queue.prune_archive(Duration::from_secs(3600)), 0);
        assert_eq!(queue.prune_archive(Duration::ZERO), 1);
        assert!(queue.task(id).is_none());
        assert_eq!(queue.load(id).await.unwrap().unwrap().state(), TaskState::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let queue = queue();
        queue.shutdown(Duration::from_millis(10)).await.unwrap();
        let err = queue.enqueue(Task::new("late", TaskKind::SingleAgent)).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::QueueClosed);
        assert!(!queue.queue_status().accepting);
    }
}

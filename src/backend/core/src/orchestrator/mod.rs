//! Orchestrator - the owned entry point to the task queue.
//!
//! Holds the queue, the store and the configuration with an explicit
//! start/shutdown lifecycle. `start()` recovers work interrupted by a previous
//! run; `shutdown()` drains what is running and flushes persistence.

pub mod plan;

pub use plan::{build_plan, load_plan, TaskDefinition};

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::dag::{Task, TaskId, TaskKind, TaskState};
use crate::error::Result;
use crate::executor::{CommandExecutor, Executor, ExecutorRegistry};
use crate::interpreter::InterpreterRegistry;
use crate::recovery::FailureRecovery;
use crate::scheduler::{QueueStatus, RateLimiter, TaskEvent, TaskQueue};
use crate::store::TaskStore;

/// What `start()` found in the store.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Tasks re-admitted to the queue
    pub recovered: usize,
    /// Recovered tasks cancelled because a prerequisite was lost
    pub orphaned: usize,
    /// Interrupted composite steps dropped in favour of a fresh parent attempt
    pub superseded: usize,
    /// Records the queue refused
    pub rejected: usize,
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: Config,
    executors: ExecutorRegistry,
    registered: HashSet<TaskKind>,
    interpreters: Option<InterpreterRegistry>,
    recovery: Option<FailureRecovery>,
    store: Option<Arc<dyn TaskStore>>,
}

impl OrchestratorBuilder {
    /// Executor for `kind`. Takes precedence over a command configured for it.
    pub fn executor(mut self, kind: TaskKind, executor: Arc<dyn Executor>) -> Self {
        self.executors.register(kind, executor);
        self.registered.insert(kind);
        self
    }

    pub fn interpreters(mut self, interpreters: InterpreterRegistry) -> Self {
        self.interpreters = Some(interpreters);
        self
    }

    /// Recovery hooks (substitute resolver, compensation).
    pub fn recovery(mut self, recovery: FailureRecovery) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Use `store` instead of the backend named in the configuration.
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn build(self) -> Result<Orchestrator> {
        let Self {
            config,
            mut executors,
            registered,
            interpreters,
            recovery,
            store,
        } = self;

        config.validate()?;

        let store = match store {
            Some(store) => store,
            None => crate::store::from_config(&config.persistence).await?,
        };

        for (kind, spec) in &config.executors {
            let kind = TaskKind::from_str(kind)?;
            if registered.contains(&kind) {
                continue;
            }
            tracing::debug!(kind = %kind, command = ?spec.command, "Command executor configured");
            executors.register(kind, Arc::new(CommandExecutor::new(spec.clone())));
        }

        let interpreters =
            interpreters.unwrap_or_else(|| InterpreterRegistry::with_builtins(config.interpreter.clone()));

        let mut builder = TaskQueue::builder()
            .config(config.scheduler.clone())
            .executors(executors)
            .interpreters(interpreters)
            .rate_limiter(RateLimiter::from_config(&config.rate_limit))
            .store(store.clone())
            .write_attempts(config.persistence.write_attempts);
        if let Some(recovery) = recovery {
            builder = builder.recovery(recovery);
        }

        tracing::info!(
            store = store.name(),
            max_concurrency = config.scheduler.max_concurrency,
            requests_per_minute = config.rate_limit.requests_per_minute,
            recovery_strategy = %config.scheduler.recovery_strategy,
            "Orchestrator initialized"
        );

        Ok(Orchestrator {
            queue: builder.build(),
            store,
            config,
            started: AtomicBool::new(false),
        })
    }
}

/// The task-queue core as one explicit instance.
pub struct Orchestrator {
    config: Config,
    queue: TaskQueue,
    store: Arc<dyn TaskStore>,
    started: AtomicBool,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.store.name())
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("queue", &self.queue)
            .finish()
    }
}

impl Orchestrator {
    pub fn builder(config: Config) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            executors: ExecutorRegistry::new(),
            registered: HashSet::new(),
            interpreters: None,
            recovery: None,
            store: None,
        }
    }

    /// Build with everything taken from `config`.
    pub async fn from_config(config: Config) -> Result<Self> {
        Self::builder(config).build().await
    }

    /// Re-admit tasks a previous run left unfinished. Runs once; later calls
    /// report nothing.
    pub async fn start(&self) -> Result<RecoveryReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Orchestrator already started");
            return Ok(RecoveryReport::default());
        }

        let mut report = RecoveryReport::default();
        let tasks = self.store.load_incomplete().await?;
        if tasks.is_empty() {
            tracing::info!(store = self.store.name(), "No interrupted tasks to recover");
            return Ok(report);
        }

        let recovering: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();
        let composites: HashSet<TaskId> = tasks
            .iter()
            .filter(|t| t.kind == TaskKind::Composite)
            .map(|t| t.id)
            .collect();

        // A composite re-runs from scratch and builds new steps, so its old
        // steps are settled here instead of being recovered alongside it.
        let (superseded, mut tasks): (Vec<Task>, Vec<Task>) = tasks
            .into_iter()
            .partition(|t| t.parent_id.is_some_and(|p| composites.contains(&p)));
        let superseded_ids: HashSet<TaskId> = superseded.iter().map(|t| t.id).collect();
        for mut step in superseded {
            if let Err(e) = step.cancel("composite parent restarted") {
                tracing::warn!(task_id = %step.id, error = %e, "Composite step could not be settled");
                continue;
            }
            self.store.save(&step).await?;
            report.superseded += 1;
        }

        let mut settled: HashMap<TaskId, Option<Task>> = HashMap::new();
        for task in &mut tasks {
            task.reset_for_recovery();
            if task.kind == TaskKind::Composite {
                task.children.retain(|child| !superseded_ids.contains(child));
            }

            let outside: Vec<TaskId> = task
                .depends_on
                .iter()
                .copied()
                .filter(|dep| !recovering.contains(dep) || superseded_ids.contains(dep))
                .collect();
            for dep in outside {
                if !settled.contains_key(&dep) {
                    settled.insert(dep, self.store.load(dep).await?);
                }
                if let Some(Some(upstream)) = settled.get(&dep) {
                    if upstream.state() == TaskState::Completed {
                        let result = upstream.result().cloned().unwrap_or(Value::Null);
                        task.depends_on.remove(&dep);
                        task.record_upstream(dep, result);
                    }
                }
                // Anything else stays as a dangling prerequisite and the queue
                // cancels the task on admission.
            }
        }

        let admission = self.queue.admit_recovered(tasks);
        for (task_id, error) in &admission.rejected {
            tracing::warn!(task_id = %task_id, error = %error, "Recovered task rejected");
        }
        report.recovered = admission.admitted.len().saturating_sub(admission.orphaned.len());
        report.orphaned = admission.orphaned.len();
        report.rejected = admission.rejected.len();

        tracing::info!(
            recovered = report.recovered,
            orphaned = report.orphaned,
            superseded = report.superseded,
            rejected = report.rejected,
            "Crash recovery complete"
        );
        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Submission API
    // ─────────────────────────────────────────────────────────────────────────

    /// New task carrying the configured default retry budget.
    pub fn task(&self, name: impl Into<String>, kind: TaskKind) -> Task {
        Task::new(name, kind).with_max_retries(self.config.scheduler.default_max_retries)
    }

    pub fn submit(&self, task: Task) -> Result<TaskId> {
        self.queue.enqueue(task)
    }

    /// Submit a plan. Every definition is validated before anything is queued.
    pub fn submit_plan(&self, definitions: &[TaskDefinition]) -> Result<Vec<TaskId>> {
        let tasks = build_plan(definitions, self.config.scheduler.default_max_retries)?;
        tasks.into_iter().map(|task| self.queue.enqueue(task)).collect()
    }

    pub fn cancel(&self, task_id: TaskId) -> Result<()> {
        self.queue.cancel(task_id)
    }

    pub fn status(&self, task_id: TaskId) -> Option<TaskState> {
        self.queue.status(task_id)
    }

    /// Snapshot of a task, from memory or the store.
    pub async fn get(&self, task_id: TaskId) -> Result<Option<Task>> {
        self.queue.load(task_id).await
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.queue_status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.queue.subscribe()
    }

    pub async fn wait_for(&self, task_id: TaskId) -> Result<Task> {
        self.queue.wait_for(task_id).await
    }

    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop with the configured grace period.
    pub async fn shutdown(&self) -> Result<()> {
        self.queue.shutdown(self.config.scheduler.shutdown_grace).await?;
        tracing::info!(status = ?self.queue.queue_status(), "Orchestrator stopped");
        Ok(())
    }
}

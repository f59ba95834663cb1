//! Executor contract and per-kind dispatch table.
//!
//! An [`Executor`] performs the actual work of a task. The queue owns one
//! executor per [`TaskKind`]; kinds without a registered executor fail fast
//! with a non-retryable error.
//!
//! # Example
//!
//! ```rust,ignore
//! use conductor_core::executor::{from_fn, ExecutorRegistry};
//! use conductor_core::dag::TaskKind;
//!
//! let registry = ExecutorRegistry::new().with(
//!     TaskKind::SingleAgent,
//!     from_fn(|task, _ctx| async move { Ok(serde_json::json!({"echo": task.name})) }),
//! );
//! ```

mod command;
mod composite;
mod housekeeping;

pub use command::{CommandExecutor, CommandSpec};
pub use composite::{CompositeExecutor, CompositeMode, CompositePlan, CompositeStep};
pub use housekeeping::HousekeepingExecutor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::dag::{Task, TaskId, TaskKind};
use crate::error::ConductorError;
use crate::scheduler::TaskQueue;

// ═══════════════════════════════════════════════════════════════════════════════
// Execution Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// The executor reported a failure
    Failed,
    /// The attempt exceeded its timeout
    Timeout,
    /// The attempt observed a cancellation request
    Cancelled,
}

/// Error returned by an executor.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
    pub kind: ExecutionErrorKind,
    /// Whether the queue may spend retry budget on this failure
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ExecutionError {
    /// A transient failure worth retrying.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ExecutionErrorKind::Failed,
            retryable: true,
            details: None,
        }
    }

    /// A permanent failure; retries are skipped.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ExecutionErrorKind::Failed,
            retryable: false,
            details: None,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            message: format!("task timed out after {}", humantime_serde::re::humantime::format_duration(after)),
            kind: ExecutionErrorKind::Timeout,
            retryable: true,
            details: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            message: "task was cancelled".to_string(),
            kind: ExecutionErrorKind::Cancelled,
            retryable: false,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Serialize) -> Self {
        self.details = serde_json::to_value(details).ok();
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ExecutionErrorKind::Timeout
    }
}

impl From<ConductorError> for ExecutionError {
    fn from(error: ConductorError) -> Self {
        Self {
            message: error.to_string(),
            kind: ExecutionErrorKind::Failed,
            retryable: error.is_retryable(),
            details: serde_json::to_value(error.details()).ok(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Execution Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-attempt handle given to an executor.
#[derive(Clone)]
pub struct ExecutionContext {
    task_id: TaskId,
    attempt: u32,
    cancellation: CancellationToken,
    queue: TaskQueue,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

impl ExecutionContext {
    pub(crate) fn new(
        task_id: TaskId,
        attempt: u32,
        cancellation: CancellationToken,
        queue: TaskQueue,
    ) -> Self {
        Self {
            task_id,
            attempt,
            cancellation,
            queue,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Run `future` unless cancellation arrives first.
    pub async fn cancellable<F, T>(&self, future: F) -> Result<T, ExecutionError>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            result = future => Ok(result),
            _ = self.cancellation.cancelled() => Err(ExecutionError::cancelled()),
        }
    }

    /// The queue running this task, for executors that submit nested work.
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Executor Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Performs the work of one task attempt.
///
/// Implementations should watch [`ExecutionContext::cancelled`] and stop
/// promptly. The queue also drops the returned future on cancellation, so
/// cancellation is best-effort for work that escapes the future (spawned
/// processes, remote calls already sent).
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute one attempt of `task`.
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<Value, ExecutionError>;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        "executor"
    }
}

/// Executor backed by an async closure.
pub struct FnExecutor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(Task, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ExecutionError>> + Send,
{
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<Value, ExecutionError> {
        (self.f)(task.clone(), ctx.clone()).await
    }

    fn name(&self) -> &'static str {
        "fn"
    }
}

/// Wrap an async closure as an executor.
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn Executor>
where
    F: Fn(Task, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ExecutionError>> + Send + 'static,
{
    Arc::new(FnExecutor { f })
}

struct Unconfigured {
    kind: TaskKind,
}

#[async_trait]
impl Executor for Unconfigured {
    async fn execute(&self, _task: &Task, _ctx: &ExecutionContext) -> Result<Value, ExecutionError> {
        Err(ExecutionError::fatal(format!(
            "no executor registered for task kind {}",
            self.kind
        )))
    }

    fn name(&self) -> &'static str {
        "unconfigured"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// One executor per task kind.
#[derive(Clone)]
pub struct ExecutorRegistry {
    single_agent: Arc<dyn Executor>,
    swarm: Arc<dyn Executor>,
    housekeeping: Arc<dyn Executor>,
    composite: Arc<dyn Executor>,
    monitoring: Arc<dyn Executor>,
    analysis: Arc<dyn Executor>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for kind in TaskKind::ALL {
            map.entry(&kind.to_string(), &self.get(kind).name());
        }
        map.finish()
    }
}

impl ExecutorRegistry {
    /// Built-in composite and housekeeping executors; other kinds unconfigured.
    pub fn new() -> Self {
        let unconfigured = |kind| Arc::new(Unconfigured { kind }) as Arc<dyn Executor>;
        Self {
            single_agent: unconfigured(TaskKind::SingleAgent),
            swarm: unconfigured(TaskKind::Swarm),
            housekeeping: Arc::new(HousekeepingExecutor),
            composite: Arc::new(CompositeExecutor),
            monitoring: unconfigured(TaskKind::Monitoring),
            analysis: unconfigured(TaskKind::Analysis),
        }
    }

    pub fn with(mut self, kind: TaskKind, executor: Arc<dyn Executor>) -> Self {
        self.register(kind, executor);
        self
    }

    pub fn register(&mut self, kind: TaskKind, executor: Arc<dyn Executor>) {
        tracing::debug!(kind = %kind, executor = executor.name(), "Executor registered");
        *self.slot(kind) = executor;
    }

    pub fn get(&self, kind: TaskKind) -> Arc<dyn Executor> {
        match kind {
            TaskKind::SingleAgent => self.single_agent.clone(),
            TaskKind::Swarm => self.swarm.clone(),
            TaskKind::Housekeeping => self.housekeeping.clone(),
            TaskKind::Composite => self.composite.clone(),
            TaskKind::Monitoring => self.monitoring.clone(),
            TaskKind::Analysis => self.analysis.clone(),
        }
    }

    fn slot(&mut self, kind: TaskKind) -> &mut Arc<dyn Executor> {
        match kind {
            TaskKind::SingleAgent => &mut self.single_agent,
            TaskKind::Swarm => &mut self.swarm,
            TaskKind::Housekeeping => &mut self.housekeeping,
            TaskKind::Composite => &mut self.composite,
            TaskKind::Monitoring => &mut self.monitoring,
            TaskKind::Analysis => &mut self.analysis,
        }
    }
}

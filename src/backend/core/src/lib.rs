#![allow(clippy::result_large_err)]
//! # Conductor Core
//!
//! Dependency-aware task queue for agent orchestration.
//!
//! ## Architecture
//!
//! - **DAG**: Task records, the state machine, and the dependency graph
//! - **Scheduler**: Priority dispatch under a concurrency bound, rate limit,
//!   retry backoff, per-kind circuit breakers, and cancellation cascades
//! - **Executors**: Pluggable per-kind workers, plus built-in composite,
//!   housekeeping, and subprocess executors
//! - **Interpreter**: Classifies results and turns suggestions into follow-up tasks
//! - **Recovery**: Decides what happens to the dependents of a failed task
//! - **Store**: Memory, file, and Redis persistence with crash recovery
//! - **Telemetry**: Structured logging and Prometheus metrics
//!
//! ## Example
//!
//! ```rust,no_run
//! use conductor_core::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> conductor_core::Result<()> {
//! let orchestrator = Orchestrator::builder(Config::default())
//!     .executor(
//!         TaskKind::SingleAgent,
//!         from_fn(|task, _ctx| async move { Ok(json!({ "done": task.name })) }),
//!     )
//!     .build()
//!     .await?;
//! orchestrator.start().await?;
//!
//! let fetch = orchestrator.submit(orchestrator.task("fetch", TaskKind::SingleAgent))?;
//! let report = orchestrator.submit(
//!     orchestrator.task("report", TaskKind::SingleAgent).with_dependency(fetch),
//! )?;
//! let report = orchestrator.wait_for(report).await?;
//! assert_eq!(report.state(), TaskState::Completed);
//!
//! orchestrator.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dag;
pub mod error;
pub mod executor;
pub mod interpreter;
pub mod orchestrator;
pub mod recovery;
pub mod scheduler;
pub mod store;
pub mod telemetry;

pub use error::{ConductorError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::dag::{DependencyGraph, Priority, Task, TaskId, TaskKind, TaskState};
    pub use crate::error::{ConductorError, ErrorCode, Result};
    pub use crate::executor::{
        from_fn, CommandExecutor, CommandSpec, ExecutionContext, ExecutionError, Executor,
        ExecutorRegistry,
    };
    pub use crate::interpreter::{
        FollowUpFactory, Interpretation, InterpreterConfig, InterpreterRegistry, Outcome,
        ResultInterpreter,
    };
    pub use crate::orchestrator::{Orchestrator, RecoveryReport, TaskDefinition};
    pub use crate::recovery::{CompensationHook, FailureRecovery, RecoveryStrategy, SubstituteResolver};
    pub use crate::scheduler::{
        QueueStatus, RateLimiter, RetryPolicy, SchedulerConfig, TaskEvent, TaskQueue,
    };
    pub use crate::store::{FileStore, MemoryStore, RedisStore, TaskStore};
}

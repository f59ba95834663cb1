//! Lifecycle events broadcast to queue subscribers.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::dag::{Priority, TaskId, TaskKind, TaskState};
use crate::recovery::RecoveryStrategy;

/// Events emitted while tasks move through the queue.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Task admitted to the queue
    Submitted {
        task_id: TaskId,
        kind: TaskKind,
        priority: Priority,
    },
    /// Executor call started
    Started { task_id: TaskId, attempt: u32 },
    /// Attempt failed, another one is scheduled
    RetryScheduled {
        task_id: TaskId,
        attempt: u32,
        #[serde(with = "humantime_serde")]
        delay: Duration,
        error: String,
    },
    /// Task settled with a result
    Completed { task_id: TaskId, result: Value },
    /// Task settled as failed
    Failed { task_id: TaskId, error: String },
    /// Task settled as cancelled
    Cancelled { task_id: TaskId, reason: String },
    /// Failure recovery resolved the dependents of a failed task
    Recovered {
        task_id: TaskId,
        strategy: RecoveryStrategy,
        affected: Vec<TaskId>,
    },
    /// A completed task produced new work
    FollowUp {
        origin: TaskId,
        task_id: TaskId,
        suggestion: String,
    },
    /// A store write failed after all attempts
    PersistenceFailed { task_id: TaskId, error: String },
}

impl TaskEvent {
    /// The task this event is about.
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Submitted { task_id, .. }
            | Self::Started { task_id, .. }
            | Self::RetryScheduled { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::Cancelled { task_id, .. }
            | Self::Recovered { task_id, .. }
            | Self::FollowUp { task_id, .. }
            | Self::PersistenceFailed { task_id, .. } => *task_id,
        }
    }

    /// The settled state, if this event marks a task leaving the queue.
    pub fn settled_state(&self) -> Option<TaskState> {
        match self {
            Self::Completed { .. } => Some(TaskState::Completed),
            Self::Failed { .. } => Some(TaskState::Failed),
            Self::Cancelled { .. } => Some(TaskState::Cancelled),
            _ => None,
        }
    }
}

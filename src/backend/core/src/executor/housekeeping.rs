//! Built-in executor for internal maintenance tasks.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::{ExecutionContext, ExecutionError, Executor};
use crate::dag::Task;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Action {
    /// Drop settled tasks older than `older_than` from the in-memory archive
    PruneArchive {
        #[serde(with = "humantime_serde", default = "default_retention")]
        older_than: Duration,
    },
    /// Wait for every queued store write to land
    Flush,
    Noop,
}

fn default_retention() -> Duration {
    Duration::from_secs(3600)
}

/// Runs `prune_archive`, `flush` and `noop` actions against the owning queue.
pub struct HousekeepingExecutor;

#[async_trait]
impl Executor for HousekeepingExecutor {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<Value, ExecutionError> {
        let action: Action = serde_json::from_value(Value::Object(task.parameters.clone()))
            .map_err(|e| ExecutionError::fatal(format!("invalid housekeeping action: {}", e)))?;

        match action {
            Action::PruneArchive { older_than } => {
                let pruned = ctx.queue().prune_archive(older_than);
                tracing::info!(pruned, "Pruned settled tasks from archive");
                Ok(json!({ "action": "prune_archive", "pruned": pruned }))
            }
            Action::Flush => {
                ctx.cancellable(ctx.queue().flush()).await??;
                Ok(json!({ "action": "flush" }))
            }
            Action::Noop => Ok(json!({ "action": "noop" })),
        }
    }

    fn name(&self) -> &'static str {
        "housekeeping"
    }
}

//! Executor that runs a configured program per attempt.
//!
//! The task is written to the child's stdin as a JSON document. Stdout is
//! parsed as JSON; anything else becomes `{"output": "<text>"}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{ExecutionContext, ExecutionError, Executor};
use crate::dag::Task;

const STDERR_TAIL: usize = 2048;

/// Program to run for a task kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandSpec {
    /// argv; the first element is the program
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Per-attempt timeout applied when the task sets none
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

pub struct CommandExecutor {
    spec: CommandSpec,
}

impl CommandExecutor {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    async fn run(&self, task: &Task) -> Result<Value, ExecutionError> {
        let Some((program, args)) = self.spec.command.split_first() else {
            return Err(ExecutionError::fatal("command executor has an empty argv"));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&self.spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecutionError::fatal(format!("failed to spawn {}: {}", program, e)))?;

        let input = serde_json::to_vec(&json!({
            "id": task.id,
            "name": task.name,
            "kind": task.kind,
            "parameters": task.parameters,
            "context": task.context,
        }))
        .map_err(|e| ExecutionError::fatal(format!("failed to encode task: {}", e)))?;

        let stdin = child.stdin.take();
        let write = async move {
            if let Some(mut stdin) = stdin {
                // A child that never reads stdin closes the pipe early.
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            }
        };
        let ((), output) = tokio::join!(write, child.wait_with_output());
        let output = output
            .map_err(|e| ExecutionError::retryable(format!("failed to wait for {}: {}", program, e)))?;

        let code = output.status.code().unwrap_or(-1);
        tracing::debug!(
            task_id = %task.id,
            program = %program,
            exit_code = code,
            "Command exited"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let start = stderr
                .char_indices()
                .rev()
                .nth(STDERR_TAIL)
                .map(|(i, _)| i)
                .unwrap_or(0);
            return Err(ExecutionError::retryable(format!(
                "{} exited with status {}",
                program, code
            ))
            .with_details(json!({ "exit_code": code, "stderr": stderr[start..].trim_end() })));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| json!({ "output": trimmed })))
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<Value, ExecutionError> {
        // Dropping the child on cancellation kills it.
        ctx.cancellable(self.run(task)).await?
    }

    fn name(&self) -> &'static str {
        "command"
    }
}

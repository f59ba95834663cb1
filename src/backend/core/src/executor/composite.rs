//! Composite tasks: a nested set of sub-tasks driven through the same queue.
//!
//! Parameters:
//!
//! ```json
//! {
//!   "mode": "dag",
//!   "steps": [
//!     {"name": "fetch", "kind": "single_agent", "parameters": {"url": "..."}},
//!     {"name": "check", "kind": "analysis", "after": [0]}
//!   ]
//! }
//! ```

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;

use super::{ExecutionContext, ExecutionError, Executor};
use crate::dag::{Priority, Task, TaskId, TaskKind, TaskState};
use crate::scheduler::TaskQueue;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeMode {
    /// Each step depends on the previous one
    #[default]
    Sequential,
    /// Steps are independent
    Parallel,
    /// Steps declare their prerequisites with `after`
    Dag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeStep {
    pub name: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Indices of earlier steps (dag mode only)
    #[serde(default)]
    pub after: Vec<usize>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompositePlan {
    #[serde(default)]
    pub mode: CompositeMode,
    #[serde(default)]
    pub steps: Vec<CompositeStep>,
}

impl CompositePlan {
    pub fn from_task(task: &Task) -> Result<Self, ExecutionError> {
        serde_json::from_value(Value::Object(task.parameters.clone()))
            .map_err(|e| ExecutionError::fatal(format!("invalid composite plan: {}", e)))
    }

    /// Build the sub-tasks, wiring dependencies according to the mode.
    pub fn build(&self, parent: &Task) -> Result<Vec<Task>, ExecutionError> {
        let mut tasks: Vec<Task> = Vec::with_capacity(self.steps.len());

        for (index, step) in self.steps.iter().enumerate() {
            let mut child = Task::new(format!("{}/{}", parent.name, step.name), step.kind)
                .with_priority(step.priority.unwrap_or(parent.priority))
                .with_parameters(step.parameters.clone())
                .with_parent(parent.id)
                .with_tag("composite-step");
            child.context = parent.context.clone();
            if let Some(max_retries) = step.max_retries {
                child = child.with_max_retries(max_retries);
            }
            if let Some(timeout) = step.timeout {
                child = child.with_timeout(timeout);
            }

            match self.mode {
                CompositeMode::Sequential => {
                    if let Some(previous) = tasks.last() {
                        child = child.with_dependency(previous.id);
                    }
                }
                CompositeMode::Parallel => {}
                CompositeMode::Dag => {
                    for &before in &step.after {
                        let Some(prerequisite) = tasks.get(before) else {
                            return Err(ExecutionError::fatal(format!(
                                "step {} ({}) may only run after earlier steps, got index {}",
                                index, step.name, before
                            )));
                        };
                        child = child.with_dependency(prerequisite.id);
                    }
                }
            }

            tasks.push(child);
        }

        Ok(tasks)
    }
}

/// Cancels unsettled children if the composite attempt is abandoned.
struct ChildGuard {
    queue: TaskQueue,
    children: Vec<TaskId>,
    armed: bool,
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for id in &self.children {
            // Already-settled children reject the cancel.
            let _ = self.queue.cancel_with_reason(*id, "parent composite attempt abandoned");
        }
    }
}

/// Submits each step as a child task and aggregates their results.
pub struct CompositeExecutor;

#[async_trait]
impl Executor for CompositeExecutor {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> Result<Value, ExecutionError> {
        let plan = CompositePlan::from_task(task)?;
        let children = plan.build(task)?;
        let queue = ctx.queue().clone();

        let mut guard = ChildGuard {
            queue: queue.clone(),
            children: Vec::with_capacity(children.len()),
            armed: true,
        };
        for child in children {
            let id = queue.enqueue(child)?;
            guard.children.push(id);
        }

        tracing::debug!(
            task_id = %task.id,
            mode = ?plan.mode,
            steps = guard.children.len(),
            "Composite steps submitted"
        );

        let settled = ctx
            .cancellable(join_all(guard.children.iter().map(|id| queue.wait_for(*id))))
            .await?;
        guard.armed = false;

        let mut results = Vec::with_capacity(settled.len());
        let mut failures = Vec::new();
        for (step, outcome) in plan.steps.iter().zip(settled) {
            let child = outcome?;
            match child.state() {
                TaskState::Completed => results.push(json!({
                    "name": step.name,
                    "task_id": child.id,
                    "result": child.result().cloned().unwrap_or(Value::Null),
                })),
                state => failures.push(json!({
                    "name": step.name,
                    "task_id": child.id,
                    "state": state,
                    "error": child.error(),
                })),
            }
        }

        if !failures.is_empty() {
            return Err(ExecutionError::fatal(format!(
                "{} of {} composite steps did not complete",
                failures.len(),
                plan.steps.len()
            ))
            .with_details(json!({ "failures": failures })));
        }

        Ok(json!({
            "mode": plan.mode,
            "steps": plan.steps.len(),
            "results": results,
        }))
    }

    fn name(&self) -> &'static str {
        "composite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent(parameters: Value) -> Task {
        let Value::Object(map) = parameters else {
            panic!("parameters must be an object");
        };
        Task::new("pipeline", TaskKind::Composite)
            .with_priority(Priority::High)
            .with_parameters(map)
    }

    #[test]
    fn test_sequential_chain() {
        let task = parent(json!({
            "steps": [
                {"name": "a", "kind": "single_agent"},
                {"name": "b", "kind": "analysis"},
                {"name": "c", "kind": "monitoring", "priority": "low"}
            ]
        }));
        let plan = CompositePlan::from_task(&task).unwrap();
        assert_eq!(plan.mode, CompositeMode::Sequential);

        let children = plan.build(&task).unwrap();
        assert!(children[0].depends_on.is_empty());
        assert!(children[1].depends_on.contains(&children[0].id));
        assert!(children[2].depends_on.contains(&children[1].id));
        assert_eq!(children[0].priority, Priority::High);
        assert_eq!(children[2].priority, Priority::Low);
        assert!(children.iter().all(|c| c.parent_id == Some(task.id)));
        assert_eq!(children[1].name, "pipeline/b");
    }

    #[test]
    fn test_parallel_has_no_edges() {
        let task = parent(json!({
            "mode": "parallel",
            "steps": [
                {"name": "a", "kind": "single_agent"},
                {"name": "b", "kind": "single_agent"}
            ]
        }));
        let children = CompositePlan::from_task(&task).unwrap().build(&task).unwrap();
        assert!(children.iter().all(|c| c.depends_on.is_empty()));
    }

    #[test]
    fn test_dag_edges_and_forward_reference() {
        let task = parent(json!({
            "mode": "dag",
            "steps": [
                {"name": "a", "kind": "single_agent"},
                {"name": "b", "kind": "single_agent"},
                {"name": "c", "kind": "analysis", "after": [0, 1]}
            ]
        }));
        let children = CompositePlan::from_task(&task).unwrap().build(&task).unwrap();
        assert_eq!(children[2].depends_on.len(), 2);

        let invalid = parent(json!({
            "mode": "dag",
            "steps": [{"name": "a", "kind": "single_agent", "after": [0]}]
        }));
        let err = CompositePlan::from_task(&invalid)
            .unwrap()
            .build(&invalid)
            .unwrap_err();
        assert!(!err.retryable);
    }

    #[test]
    fn test_invalid_plan_is_fatal() {
        let task = parent(json!({"steps": [{"name": "a", "kind": "teleport"}]}));
        let err = CompositePlan::from_task(&task).unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("invalid composite plan"));
    }
}

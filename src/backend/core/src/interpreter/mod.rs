//! Result interpretation and follow-up generation.
//!
//! Every completed task passes through the interpreter registered for its
//! kind. An interpreter classifies the result and may name suggestions; each
//! suggestion with a registered [`FollowUpFactory`] becomes a new task that the
//! queue submits. Failed tasks never reach this module.

mod builtin;

pub use builtin::{
    AgentInterpreter, AnalysisInterpreter, DefaultInterpreter, MonitoringInterpreter,
    SwarmInterpreter,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::dag::{Task, TaskKind, TaskState};

/// Parameter carrying the id of the task a follow-up came from.
pub const ORIGIN_PARAM: &str = "origin_task_id";
/// Parameter carrying how many follow-up hops separate a task from user work.
pub const DEPTH_PARAM: &str = "follow_up_depth";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure => f.write_str("failure"),
        }
    }
}

/// Verdict on a completed task's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interpretation {
    pub outcome: Outcome,
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Interpretation {
    pub fn success() -> Self {
        Self {
            outcome: Outcome::Success,
            suggestions: Vec::new(),
            summary: None,
        }
    }

    pub fn failure(summary: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failure,
            suggestions: Vec::new(),
            summary: Some(summary.into()),
        }
    }

    pub fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// Classifies the result of a completed task.
pub trait ResultInterpreter: Send + Sync {
    fn interpret(&self, task: &Task, result: &Value) -> Interpretation;
}

/// Builds the follow-up task for one suggestion.
pub trait FollowUpFactory: Send + Sync {
    fn build(&self, origin: &Task, result: &Value) -> Task;
}

impl<F> FollowUpFactory for F
where
    F: Fn(&Task, &Value) -> Task + Send + Sync,
{
    fn build(&self, origin: &Task, result: &Value) -> Task {
        self(origin, result)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Submit follow-up tasks for suggestions
    pub follow_ups: bool,
    /// Follow-ups of follow-ups stop at this depth
    pub max_follow_up_depth: u32,
    /// Analysis results scoring below this ask for a deeper pass
    pub quality_threshold: f64,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            follow_ups: true,
            max_follow_up_depth: 2,
            quality_threshold: 0.7,
        }
    }
}

/// A follow-up ready for submission.
#[derive(Debug, Clone)]
pub struct FollowUp {
    pub suggestion: String,
    pub task: Task,
}

/// Interpreters by kind, the default fallback, and follow-up factories.
#[derive(Clone)]
pub struct InterpreterRegistry {
    config: InterpreterConfig,
    interpreters: HashMap<TaskKind, Arc<dyn ResultInterpreter>>,
    fallback: Arc<dyn ResultInterpreter>,
    factories: HashMap<String, Arc<dyn FollowUpFactory>>,
}

impl fmt::Debug for InterpreterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<String> = self.interpreters.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        let mut factories: Vec<&String> = self.factories.keys().collect();
        factories.sort();
        f.debug_struct("InterpreterRegistry")
            .field("config", &self.config)
            .field("interpreters", &kinds)
            .field("factories", &factories)
            .finish()
    }
}

impl Default for InterpreterRegistry {
    fn default() -> Self {
        Self::with_builtins(InterpreterConfig::default())
    }
}

impl InterpreterRegistry {
    /// Only the default interpreter, no factories.
    pub fn empty(config: InterpreterConfig) -> Self {
        Self {
            config,
            interpreters: HashMap::new(),
            fallback: Arc::new(DefaultInterpreter),
            factories: HashMap::new(),
        }
    }

    /// Built-in interpreters and factories for the standard kinds.
    pub fn with_builtins(config: InterpreterConfig) -> Self {
        let threshold = config.quality_threshold;
        let mut registry = Self::empty(config);

        registry.register_interpreter(TaskKind::SingleAgent, AgentInterpreter);
        registry.register_interpreter(TaskKind::Swarm, SwarmInterpreter);
        registry.register_interpreter(TaskKind::Analysis, AnalysisInterpreter::new(threshold));
        registry.register_interpreter(TaskKind::Monitoring, MonitoringInterpreter);
        builtin::register_factories(&mut registry);

        registry
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    pub fn register_interpreter(&mut self, kind: TaskKind, interpreter: impl ResultInterpreter + 'static) {
        self.interpreters.insert(kind, Arc::new(interpreter));
    }

    pub fn register_factory(&mut self, suggestion: impl Into<String>, factory: impl FollowUpFactory + 'static) {
        self.factories.insert(suggestion.into(), Arc::new(factory));
    }

    /// Interpret a completed task. Returns `None` for any other state.
    pub fn interpret(&self, task: &Task) -> Option<Interpretation> {
        if task.state() != TaskState::Completed {
            return None;
        }
        let result = task.result().unwrap_or(&Value::Null);
        let interpreter = self.interpreters.get(&task.kind).unwrap_or(&self.fallback);
        Some(interpreter.interpret(task, result))
    }

    /// Build follow-ups for the suggestions in `interpretation`.
    pub fn follow_ups(&self, origin: &Task, interpretation: &Interpretation) -> Vec<FollowUp> {
        if !self.config.follow_ups || interpretation.suggestions.is_empty() {
            return Vec::new();
        }

        let depth = follow_up_depth(origin);
        if depth >= self.config.max_follow_up_depth {
            tracing::debug!(
                task_id = %origin.id,
                depth,
                suggestions = ?interpretation.suggestions,
                "Follow-up depth reached, dropping suggestions"
            );
            return Vec::new();
        }

        let result = origin.result().unwrap_or(&Value::Null);
        interpretation
            .suggestions
            .iter()
            .filter_map(|suggestion| {
                let Some(factory) = self.factories.get(suggestion) else {
                    tracing::debug!(task_id = %origin.id, suggestion = %suggestion, "No factory for suggestion");
                    return None;
                };

                let mut task = factory.build(origin, result);
                task.parameters.insert(ORIGIN_PARAM.into(), json!(origin.id));
                task.parameters.insert(DEPTH_PARAM.into(), json!(depth + 1));
                task.add_tag(format!("follow-up:{}", suggestion));
                Some(FollowUp {
                    suggestion: suggestion.clone(),
                    task,
                })
            })
            .collect()
    }
}

/// Follow-up hops recorded on `task` (0 for user-submitted work).
pub fn follow_up_depth(task: &Task) -> u32 {
    task.parameters
        .get(DEPTH_PARAM)
        .and_then(Value::as_u64)
        .map(|d| d.min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(kind: TaskKind, result: Value) -> Task {
        let mut task = Task::new("origin", kind);
        task.transition(TaskState::Queued).unwrap();
        task.transition(TaskState::Ready).unwrap();
        task.transition(TaskState::Running).unwrap();
        task.complete(result).unwrap();
        task
    }

    #[test]
    fn test_non_completed_tasks_are_not_interpreted() {
        let registry = InterpreterRegistry::default();
        let mut task = Task::new("t", TaskKind::SingleAgent);
        assert!(registry.interpret(&task).is_none());

        task.transition(TaskState::Queued).unwrap();
        task.transition(TaskState::Ready).unwrap();
        task.transition(TaskState::Running).unwrap();
        task.fail("boom").unwrap();
        assert!(registry.interpret(&task).is_none());
    }

    #[test]
    fn test_unknown_kind_uses_default() {
        let registry = InterpreterRegistry::default();
        let task = completed(TaskKind::Housekeeping, json!({"success": false}));
        let verdict = registry.interpret(&task).unwrap();
        assert_eq!(verdict.outcome, Outcome::Failure);
        assert!(verdict.suggestions.is_empty());
    }

    #[test]
    fn test_follow_up_parameters() {
        let registry = InterpreterRegistry::default();
        let task = completed(TaskKind::Swarm, json!({"consensus": false}));
        let verdict = registry.interpret(&task).unwrap();

        let follow_ups = registry.follow_ups(&task, &verdict);
        assert_eq!(follow_ups.len(), 1);
        let follow_up = &follow_ups[0];
        assert_eq!(follow_up.suggestion, "resolve_disagreement");
        assert_eq!(follow_up.task.parameters[ORIGIN_PARAM], json!(task.id));
        assert_eq!(follow_up_depth(&follow_up.task), 1);
        assert!(follow_up.task.metadata.tags.contains("follow-up:resolve_disagreement"));
        assert_eq!(follow_up.task.state(), TaskState::Created);
    }

    #[test]
    fn test_depth_limit() {
        let registry = InterpreterRegistry::with_builtins(InterpreterConfig {
            max_follow_up_depth: 1,
            ..Default::default()
        });
        let mut task = completed(TaskKind::Swarm, json!({"consensus": false}));
        task.parameters.insert(DEPTH_PARAM.into(), json!(1));
        let verdict = registry.interpret(&task).unwrap();

        assert_eq!(verdict.suggestions, vec!["resolve_disagreement"]);
        assert!(registry.follow_ups(&task, &verdict).is_empty());
    }

    #[test]
    fn test_disabled_follow_ups() {
        let registry = InterpreterRegistry::with_builtins(InterpreterConfig {
            follow_ups: false,
            ..Default::default()
        });
        let task = completed(TaskKind::Swarm, json!({"consensus": false}));
        let verdict = registry.interpret(&task).unwrap();
        assert!(registry.follow_ups(&task, &verdict).is_empty());
    }

    #[test]
    fn test_custom_factory_and_interpreter() {
        struct AlwaysRetry;
        impl ResultInterpreter for AlwaysRetry {
            fn interpret(&self, _task: &Task, _result: &Value) -> Interpretation {
                Interpretation::success().suggest("again")
            }
        }

        let mut registry = InterpreterRegistry::empty(InterpreterConfig::default());
        registry.register_interpreter(TaskKind::Housekeeping, AlwaysRetry);
        registry.register_factory("again", |origin: &Task, _: &Value| {
            Task::new(format!("{} again", origin.name), origin.kind)
        });

        let task = completed(TaskKind::Housekeeping, json!(null));
        let verdict = registry.interpret(&task).unwrap();
        let follow_ups = registry.follow_ups(&task, &verdict);
        assert_eq!(follow_ups[0].task.name, "origin again");
    }
}

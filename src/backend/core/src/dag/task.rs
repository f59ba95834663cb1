//! Task definitions and state management.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ConductorError, Result};
use crate::recovery::RecoveryStrategy;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// State of a task in the execution lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Built by a submitter, not yet admitted
    Created,
    /// Admitted and waiting for dependencies and a slot
    Queued,
    /// Selected for dispatch
    Ready,
    /// Executor call in flight
    Running,
    /// Finished with a result
    Completed,
    /// Last attempt failed; may be re-queued while retry budget remains
    Failed,
    /// Withdrawn by a caller or by failure recovery
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 7] = [
        TaskState::Created,
        TaskState::Queued,
        TaskState::Ready,
        TaskState::Running,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    /// Check if transition to another state is valid.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, target),
            (Created, Queued)
                | (Created, Cancelled)
                | (Queued, Ready)
                | (Queued, Cancelled)
                | (Ready, Running)
                | (Ready, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Queued)
                | (Failed, Cancelled)
        )
    }

    /// Completed and Cancelled admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Created => "created",
            TaskState::Queued => "queued",
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What kind of work a task represents. Selects the executor and interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// One agent working on one instruction
    SingleAgent,
    /// Several agents collaborating on one instruction
    Swarm,
    /// Internal maintenance of the queue itself
    Housekeeping,
    /// A nested sequence of sub-tasks
    Composite,
    /// Health and alert checks
    Monitoring,
    /// Evaluation or review of other output
    Analysis,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::SingleAgent,
        TaskKind::Swarm,
        TaskKind::Housekeeping,
        TaskKind::Composite,
        TaskKind::Monitoring,
        TaskKind::Analysis,
    ];

    /// Static duration estimate used for critical-path diagnostics.
    pub fn estimated_duration(&self) -> Duration {
        match self {
            TaskKind::SingleAgent => Duration::from_secs(300),
            TaskKind::Swarm => Duration::from_secs(900),
            TaskKind::Housekeeping => Duration::from_secs(30),
            TaskKind::Composite => Duration::from_secs(600),
            TaskKind::Monitoring => Duration::from_secs(60),
            TaskKind::Analysis => Duration::from_secs(180),
        }
    }

    /// Composite tasks only coordinate children, so they hold no execution slot.
    pub fn occupies_slot(&self) -> bool {
        !matches!(self, TaskKind::Composite)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskKind::SingleAgent => "single_agent",
            TaskKind::Swarm => "swarm",
            TaskKind::Housekeeping => "housekeeping",
            TaskKind::Composite => "composite",
            TaskKind::Monitoring => "monitoring",
            TaskKind::Analysis => "analysis",
        };
        f.write_str(name)
    }
}

impl FromStr for TaskKind {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.to_string() == s)
            .ok_or_else(|| ConductorError::configuration(format!("Unknown task kind: {}", s)))
    }
}

/// Dispatch priority. Lower values are served first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
    Idle = 4,
}

impl Priority {
    /// Scale factor applied to kind duration estimates.
    pub fn duration_multiplier(&self) -> f64 {
        match self {
            Priority::Critical => 0.5,
            Priority::High => 0.75,
            Priority::Normal => 1.0,
            Priority::Low => 1.25,
            Priority::Idle => 1.5,
        }
    }
}

/// Result slot. Holds a result or an error, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Result(Value),
    Error(String),
}

/// Timestamps, derived durations and free-form annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Time between entering Queued and entering Running
    pub queue_wait_ms: Option<u64>,

    /// Time between entering Running and the end of the attempt
    pub execution_ms: Option<u64>,

    /// Time between creation and the end of the last attempt
    pub total_ms: Option<u64>,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default)]
    pub notes: Vec<String>,
}

impl TaskMetadata {
    fn new() -> Self {
        Self {
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            completed_at: None,
            queue_wait_ms: None,
            execution_ms: None,
            total_ms: None,
            tags: BTreeSet::new(),
            notes: Vec::new(),
        }
    }
}

fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

/// Context key under which prerequisite results are delivered.
pub const UPSTREAM_KEY: &str = "upstream";

/// A unit of delegated work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,

    /// Human-readable name
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub kind: TaskKind,

    pub priority: Priority,

    state: TaskState,

    /// Executor input, opaque to the queue
    #[serde(default)]
    pub parameters: Map<String, Value>,

    /// Executor context, opaque to the queue except for `upstream`
    #[serde(default)]
    pub context: Map<String, Value>,

    outcome: Option<TaskOutcome>,

    /// Parent task ID (if this is a subtask)
    pub parent_id: Option<TaskId>,

    #[serde(default)]
    pub children: Vec<TaskId>,

    /// Tasks that must complete before this one runs
    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,

    /// Tasks that depend on this one. Maintained by the dependency graph.
    #[serde(default)]
    pub(crate) blocks: BTreeSet<TaskId>,

    pub max_retries: u32,

    retry_count: u32,

    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Overrides the queue-wide failure recovery strategy
    #[serde(default)]
    pub recovery: Option<RecoveryStrategy>,

    pub metadata: TaskMetadata,
}

impl Task {
    /// Create a new task in the Created state.
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            description: String::new(),
            kind,
            priority: Priority::Normal,
            state: TaskState::Created,
            parameters: Map::new(),
            context: Map::new(),
            outcome: None,
            parent_id: None,
            children: Vec::new(),
            depends_on: BTreeSet::new(),
            blocks: BTreeSet::new(),
            max_retries: 3,
            retry_count: 0,
            timeout: None,
            recovery: None,
            metadata: TaskMetadata::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_dependency(mut self, dependency: TaskId) -> Self {
        self.depends_on.insert(dependency);
        self
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = TaskId>) -> Self {
        self.depends_on.extend(dependencies);
        self
    }

    pub fn with_parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_recovery(mut self, strategy: RecoveryStrategy) -> Self {
        self.recovery = Some(strategy);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.metadata.tags.insert(tag.into());
        self
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn blocks(&self) -> &BTreeSet<TaskId> {
        &self.blocks
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn outcome(&self) -> Option<&TaskOutcome> {
        self.outcome.as_ref()
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            Some(TaskOutcome::Result(value)) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            Some(TaskOutcome::Error(message)) => Some(message),
            _ => None,
        }
    }

    /// Result of a completed prerequisite, as delivered by the queue.
    pub fn upstream_result(&self, dependency: TaskId) -> Option<&Value> {
        self.context.get(UPSTREAM_KEY)?.get(dependency.to_string())
    }

    /// Store a prerequisite's result under `context.upstream.<id>`.
    pub fn record_upstream(&mut self, dependency: TaskId, result: Value) {
        let upstream = self
            .context
            .entry(UPSTREAM_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if !upstream.is_object() {
            *upstream = Value::Object(Map::new());
        }
        if let Value::Object(map) = upstream {
            map.insert(dependency.to_string(), result);
        }
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.metadata.notes.push(note.into());
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.metadata.tags.insert(tag.into());
    }

    /// Move to `to` if the edge is legal, recording timestamps.
    pub fn transition(&mut self, to: TaskState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(ConductorError::invalid_state_transition(self.state, to));
        }
        self.enter(to);
        Ok(())
    }

    /// Running -> Completed with a result.
    pub fn complete(&mut self, result: Value) -> Result<()> {
        self.transition(TaskState::Completed)?;
        self.outcome = Some(TaskOutcome::Result(result));
        Ok(())
    }

    /// Running -> Failed with an error.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(TaskState::Failed)?;
        self.outcome = Some(TaskOutcome::Error(error.into()));
        Ok(())
    }

    /// Cancel from any non-terminal state.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.state.is_terminal() {
            return Err(ConductorError::invalid_state_transition(self.state, TaskState::Cancelled));
        }
        self.enter(TaskState::Cancelled);
        self.add_note(format!("cancelled: {}", reason.into()));
        Ok(())
    }

    /// Whether another attempt fits in the retry budget.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub(crate) fn record_retry(&mut self) {
        self.retry_count += 1;
    }

    /// Reset an interrupted task so it can be admitted again after a restart.
    pub(crate) fn reset_for_recovery(&mut self) {
        let previous = self.state;
        self.state = TaskState::Created;
        self.outcome = None;
        self.blocks.clear();
        self.add_tag("recovered");
        self.add_note(format!("recovered after restart from {}", previous));
    }

    fn enter(&mut self, to: TaskState) {
        let now = Utc::now();
        match to {
            TaskState::Queued => {
                self.metadata.queued_at = Some(now);
                self.outcome = None;
            }
            TaskState::Running => {
                self.metadata.started_at = Some(now);
                self.metadata.queue_wait_ms =
                    self.metadata.queued_at.map(|queued| millis_between(queued, now));
            }
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled => {
                self.metadata.completed_at = Some(now);
                self.metadata.execution_ms =
                    self.metadata.started_at.map(|started| millis_between(started, now));
                self.metadata.total_ms = Some(millis_between(self.metadata.created_at, now));
            }
            TaskState::Created | TaskState::Ready => {}
        }
        self.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn task_in(state: TaskState) -> Task {
        let mut task = Task::new("sample", TaskKind::SingleAgent);
        task.state = state;
        task
    }

    #[test]
    fn test_state_machine_closure() {
        for from in TaskState::ALL {
            for to in TaskState::ALL {
                let mut task = task_in(from);
                let result = task.transition(to);
                if from.can_transition_to(to) {
                    assert!(result.is_ok(), "{} -> {} should be legal", from, to);
                    assert_eq!(task.state(), to);
                } else {
                    let err = result.unwrap_err();
                    assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
                    assert_eq!(task.state(), from, "{} -> {} changed state", from, to);
                }
            }
        }
    }

    #[test]
    fn test_legal_edge_count() {
        let legal = TaskState::ALL
            .iter()
            .flat_map(|from| TaskState::ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .count();
        assert_eq!(legal, 11);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Failed.is_terminal());
    }

    #[test]
    fn test_lifecycle_timestamps() {
        let mut task = Task::new("lifecycle", TaskKind::Analysis);
        task.transition(TaskState::Queued).unwrap();
        assert!(task.metadata.queued_at.is_some());

        task.transition(TaskState::Ready).unwrap();
        task.transition(TaskState::Running).unwrap();
        assert!(task.metadata.started_at.is_some());
        assert!(task.metadata.queue_wait_ms.is_some());

        task.complete(serde_json::json!({"ok": true})).unwrap();
        assert!(task.metadata.completed_at.is_some());
        assert!(task.metadata.execution_ms.is_some());
        assert!(task.metadata.total_ms.is_some());
        assert_eq!(task.result(), Some(&serde_json::json!({"ok": true})));
        assert!(task.error().is_none());
    }

    #[test]
    fn test_retry_clears_error() {
        let mut task = task_in(TaskState::Running);
        task.fail("boom").unwrap();
        assert_eq!(task.error(), Some("boom"));
        assert!(task.result().is_none());

        task.transition(TaskState::Queued).unwrap();
        assert!(task.outcome().is_none());
    }

    #[test]
    fn test_cancel_from_any_non_terminal_state() {
        for state in TaskState::ALL {
            let mut task = task_in(state);
            let result = task.cancel("test");
            if state.is_terminal() {
                assert!(result.is_err());
                assert_eq!(task.state(), state);
            } else {
                assert!(result.is_ok());
                assert_eq!(task.state(), TaskState::Cancelled);
                assert!(task.metadata.notes.iter().any(|n| n.contains("test")));
            }
        }
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Low < Priority::Idle);
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.to_string().parse::<TaskKind>().unwrap(), kind);
        }
        assert!("quantum".parse::<TaskKind>().is_err());
    }

    #[test]
    fn test_recovery_reset() {
        let mut task = task_in(TaskState::Running);
        task.reset_for_recovery();
        assert_eq!(task.state(), TaskState::Created);
        assert!(task.metadata.tags.contains("recovered"));
        assert!(task.metadata.notes[0].contains("running"));
    }

    #[test]
    fn test_upstream_results() {
        let dep = TaskId::new();
        let mut task = Task::new("consumer", TaskKind::Analysis).with_context("upstream", "garbage");
        assert!(task.upstream_result(dep).is_none());

        task.record_upstream(dep, serde_json::json!({"x": 1}));
        assert_eq!(task.upstream_result(dep), Some(&serde_json::json!({"x": 1})));
    }
}

//! Interpreters and follow-up factories for the standard task kinds.

use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::LazyLock;

use super::{Interpretation, InterpreterRegistry, ResultInterpreter};
use crate::dag::{Priority, Task, TaskKind};

static FAILING_TESTS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(test result: FAILED|\b[1-9]\d* (failed|failing)\b|^FAILED\b|^FAIL\b|\bAssertionError\b|\bpanicked at\b)")
        .expect("Invalid failing-tests regex")
});

fn text_output(result: &Value) -> String {
    ["test_output", "output", "stdout"]
        .iter()
        .filter_map(|key| result.get(*key).and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Reports bare success/failure from a `success` flag; never suggests work.
pub struct DefaultInterpreter;

impl ResultInterpreter for DefaultInterpreter {
    fn interpret(&self, _task: &Task, result: &Value) -> Interpretation {
        match result.get("success").and_then(Value::as_bool) {
            Some(false) => Interpretation::failure("result reported success=false"),
            _ => Interpretation::success(),
        }
    }
}

/// Single-agent work: test failures, exit codes, and modified files.
pub struct AgentInterpreter;

impl ResultInterpreter for AgentInterpreter {
    fn interpret(&self, task: &Task, result: &Value) -> Interpretation {
        let output = text_output(result);
        if FAILING_TESTS_REGEX.is_match(&output) {
            return Interpretation::failure("output reports failing tests").suggest("fix_failing_tests");
        }

        if let Some(code) = result.get("exit_code").and_then(Value::as_i64) {
            if code != 0 {
                return Interpretation::failure(format!("agent exited with code {}", code));
            }
        }

        let modified = result
            .get("files_modified")
            .and_then(Value::as_array)
            .is_some_and(|files| !files.is_empty());
        if modified {
            return Interpretation::success().suggest("run_tests");
        }

        DefaultInterpreter.interpret(task, result)
    }
}

/// Multi-agent work: agents that failed to agree.
pub struct SwarmInterpreter;

impl ResultInterpreter for SwarmInterpreter {
    fn interpret(&self, task: &Task, result: &Value) -> Interpretation {
        if result.get("consensus").and_then(Value::as_bool) == Some(false) {
            let mut verdict = Interpretation::success().suggest("resolve_disagreement");
            verdict.summary = Some("swarm did not reach consensus".into());
            return verdict;
        }
        DefaultInterpreter.interpret(task, result)
    }
}

/// Analysis work: quality scores below a threshold.
pub struct AnalysisInterpreter {
    threshold: f64,
}

impl AnalysisInterpreter {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl ResultInterpreter for AnalysisInterpreter {
    fn interpret(&self, task: &Task, result: &Value) -> Interpretation {
        match result.get("quality_score").and_then(Value::as_f64) {
            Some(score) if score < self.threshold => {
                let mut verdict = Interpretation::success().suggest("deepen_analysis");
                verdict.summary = Some(format!(
                    "quality score {:.2} below threshold {:.2}",
                    score, self.threshold
                ));
                verdict
            }
            _ => DefaultInterpreter.interpret(task, result),
        }
    }
}

/// Monitoring work: alerts and health flags.
pub struct MonitoringInterpreter;

impl ResultInterpreter for MonitoringInterpreter {
    fn interpret(&self, task: &Task, result: &Value) -> Interpretation {
        let mut verdict = match result.get("healthy").and_then(Value::as_bool) {
            Some(false) => Interpretation::failure("monitored system reported unhealthy"),
            _ => DefaultInterpreter.interpret(task, result),
        };
        let alerting = result
            .get("alerts")
            .and_then(Value::as_array)
            .is_some_and(|alerts| !alerts.is_empty());
        if alerting {
            verdict = verdict.suggest("investigate_alerts");
        }
        verdict
    }
}

fn follow_up(
    origin: &Task,
    result: &Value,
    name: &str,
    kind: TaskKind,
    priority: Priority,
    parameters: Value,
) -> Task {
    let mut task = Task::new(format!("{}: {}", name, origin.name), kind)
        .with_priority(priority)
        .with_description(format!("follow-up to {} ({})", origin.name, origin.id));
    if let Value::Object(map) = parameters {
        task.parameters = map;
    }
    let mut upstream = Map::new();
    upstream.insert(origin.id.to_string(), result.clone());
    task.context.insert("upstream".into(), Value::Object(upstream));
    task
}

pub(super) fn register_factories(registry: &mut InterpreterRegistry) {
    registry.register_factory("fix_failing_tests", |origin: &Task, result: &Value| {
        follow_up(
            origin,
            result,
            "fix failing tests",
            TaskKind::SingleAgent,
            Priority::High,
            json!({ "instruction": "fix the failing tests", "test_output": text_output(result) }),
        )
    });

    registry.register_factory("run_tests", |origin: &Task, result: &Value| {
        follow_up(
            origin,
            result,
            "run tests",
            TaskKind::SingleAgent,
            Priority::Normal,
            json!({ "instruction": "run the test suite", "files": result.get("files_modified") }),
        )
    });

    registry.register_factory("resolve_disagreement", |origin: &Task, result: &Value| {
        follow_up(
            origin,
            result,
            "resolve disagreement",
            TaskKind::Swarm,
            Priority::High,
            json!({ "positions": result.get("positions") }),
        )
    });

    registry.register_factory("deepen_analysis", |origin: &Task, result: &Value| {
        let mut parameters = origin.parameters.clone();
        parameters.insert("previous_score".into(), result.get("quality_score").cloned().unwrap_or(Value::Null));
        follow_up(
            origin,
            result,
            "deepen analysis",
            TaskKind::Analysis,
            origin.priority,
            Value::Object(parameters),
        )
    });

    registry.register_factory("investigate_alerts", |origin: &Task, result: &Value| {
        follow_up(
            origin,
            result,
            "investigate alerts",
            TaskKind::SingleAgent,
            Priority::High,
            json!({ "alerts": result.get("alerts") }),
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::Outcome;

    fn task(kind: TaskKind) -> Task {
        Task::new("t", kind)
    }

    #[test]
    fn test_agent_failing_tests() {
        let verdict = AgentInterpreter.interpret(
            &task(TaskKind::SingleAgent),
            &json!({"output": "running 4 tests\ntest result: FAILED. 3 passed; 1 failed"}),
        );
        assert_eq!(verdict.outcome, Outcome::Failure);
        assert_eq!(verdict.suggestions, vec!["fix_failing_tests"]);
    }

    #[test]
    fn test_agent_passing_tests_with_zero_failed() {
        let verdict = AgentInterpreter.interpret(
            &task(TaskKind::SingleAgent),
            &json!({"output": "test result: ok. 4 passed; 0 failed", "exit_code": 0}),
        );
        assert!(verdict.is_success());
        assert!(verdict.suggestions.is_empty());
    }

    #[test]
    fn test_agent_exit_code_and_modified_files() {
        let failed = AgentInterpreter.interpret(&task(TaskKind::SingleAgent), &json!({"exit_code": 2}));
        assert_eq!(failed.outcome, Outcome::Failure);
        assert!(failed.suggestions.is_empty());

        let modified = AgentInterpreter.interpret(
            &task(TaskKind::SingleAgent),
            &json!({"files_modified": ["src/lib.rs"]}),
        );
        assert!(modified.is_success());
        assert_eq!(modified.suggestions, vec!["run_tests"]);
    }

    #[test]
    fn test_swarm_consensus() {
        let agreed = SwarmInterpreter.interpret(&task(TaskKind::Swarm), &json!({"consensus": true}));
        assert!(agreed.suggestions.is_empty());
        let split = SwarmInterpreter.interpret(&task(TaskKind::Swarm), &json!({"consensus": false}));
        assert_eq!(split.suggestions, vec!["resolve_disagreement"]);
    }

    #[test]
    fn test_analysis_threshold() {
        let interpreter = AnalysisInterpreter::new(0.7);
        let low = interpreter.interpret(&task(TaskKind::Analysis), &json!({"quality_score": 0.4}));
        assert_eq!(low.suggestions, vec!["deepen_analysis"]);
        let high = interpreter.interpret(&task(TaskKind::Analysis), &json!({"quality_score": 0.9}));
        assert!(high.suggestions.is_empty());
    }

    #[test]
    fn test_monitoring_alerts() {
        let verdict = MonitoringInterpreter.interpret(
            &task(TaskKind::Monitoring),
            &json!({"healthy": false, "alerts": [{"name": "disk"}]}),
        );
        assert_eq!(verdict.outcome, Outcome::Failure);
        assert_eq!(verdict.suggestions, vec!["investigate_alerts"]);
    }

    #[test]
    fn test_follow_up_carries_upstream_result() {
        let mut registry = InterpreterRegistry::empty(Default::default());
        register_factories(&mut registry);
        let origin = task(TaskKind::Monitoring);
        let result = json!({"alerts": ["disk"]});

        let built = registry.factories["investigate_alerts"].build(&origin, &result);
        assert_eq!(built.kind, TaskKind::SingleAgent);
        assert_eq!(built.priority, Priority::High);
        assert_eq!(built.parameters["alerts"], json!(["disk"]));
        assert_eq!(built.context["upstream"][origin.id.to_string()], result);
    }
}

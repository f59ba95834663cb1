//! Declarative task plans.
//!
//! A plan is a JSON array of task definitions that refer to each other by
//! name. The binary reads one from `--plan`; library users can build them
//! directly.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::dag::{DependencyGraph, Priority, Task, TaskId, TaskKind};
use crate::error::{ConductorError, Result};
use crate::recovery::RecoveryStrategy;

/// One task in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique within the plan; other definitions refer to it by this name
    pub name: String,

    pub kind: TaskKind,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub parameters: Map<String, Value>,

    #[serde(default)]
    pub context: Map<String, Value>,

    /// Names of definitions in the same plan, or ids of tasks already queued
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryStrategy>,

    #[serde(default)]
    pub tags: Vec<String>,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            kind,
            priority: Priority::default(),
            description: String::new(),
            parameters: Map::new(),
            context: Map::new(),
            depends_on: Vec::new(),
            max_retries: None,
            timeout: None,
            recovery: None,
            tags: Vec::new(),
        }
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Read a plan file.
pub async fn load_plan(path: impl AsRef<Path>) -> Result<Vec<TaskDefinition>> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&raw).map_err(|e| {
        ConductorError::configuration(format!("invalid plan {}: {}", path.display(), e))
    })
}

/// Turn definitions into tasks, ordered so every task follows its prerequisites.
///
/// Names resolve within the plan first; anything else must parse as a task
/// id and is left for the queue to resolve.
pub fn build_plan(definitions: &[TaskDefinition], default_max_retries: u32) -> Result<Vec<Task>> {
    let mut ids: HashMap<&str, TaskId> = HashMap::with_capacity(definitions.len());
    for definition in definitions {
        if ids.insert(definition.name.as_str(), TaskId::new()).is_some() {
            return Err(ConductorError::configuration(format!(
                "plan defines '{}' more than once",
                definition.name
            )));
        }
    }

    let mut graph = DependencyGraph::new();
    for definition in definitions {
        let mut task = Task::new(definition.name.clone(), definition.kind)
            .with_priority(definition.priority)
            .with_description(definition.description.clone())
            .with_parameters(definition.parameters.clone())
            .with_max_retries(definition.max_retries.unwrap_or(default_max_retries));
        task.id = ids[definition.name.as_str()];
        task.context = definition.context.clone();
        task.timeout = definition.timeout;
        task.recovery = definition.recovery;
        for tag in &definition.tags {
            task.add_tag(tag.clone());
        }

        for dependency in &definition.depends_on {
            let id = match ids.get(dependency.as_str()) {
                Some(id) => *id,
                None => dependency.parse::<TaskId>().map_err(|_| {
                    ConductorError::configuration(format!(
                        "'{}' depends on unknown task '{}'",
                        definition.name, dependency
                    ))
                })?,
            };
            task.depends_on.insert(id);
        }

        graph.add(task)?;
    }

    // Removing would unwire dependents, so hand out copies.
    let order = graph.topological_order()?;
    Ok(order.into_iter().filter_map(|id| graph.get(id).cloned()).collect())
}

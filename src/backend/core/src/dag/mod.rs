//! Dependency graph for task scheduling.
//!
//! This module handles:
//! - Task records and their state machine
//! - `depends_on` / `blocks` edge bookkeeping
//! - Cycle detection at insertion time
//! - Ready-set, topological and batch orderings

mod analysis;
mod task;

pub use analysis::CriticalPath;
pub use task::{Priority, Task, TaskId, TaskKind, TaskMetadata, TaskOutcome, TaskState, UPSTREAM_KEY};

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::{ConductorError, Result};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Gray,
    Black,
}

/// Active tasks and the "A is a prerequisite of B" edge set.
///
/// `blocks` is always the transpose of `depends_on` for tasks present in the
/// graph. A `depends_on` entry naming a task that is not (yet) present is kept
/// as a forward reference and wired up when that task is added.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    tasks: HashMap<TaskId, Task>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task, wiring edges in both directions.
    ///
    /// Rejects the task with `CyclicDependency` if it closes a cycle; the graph
    /// is left exactly as it was.
    pub fn add(&mut self, mut task: Task) -> Result<TaskId> {
        let task_id = task.id;

        if self.tasks.contains_key(&task_id) {
            return Err(ConductorError::task_already_exists(task_id));
        }
        if task.depends_on.contains(&task_id) {
            return Err(ConductorError::cyclic_dependency(task_id));
        }

        task.blocks = self
            .tasks
            .values()
            .filter(|other| other.depends_on.contains(&task_id))
            .map(|other| other.id)
            .collect();

        let wired: Vec<TaskId> = task
            .depends_on
            .iter()
            .filter(|dep| self.tasks.contains_key(dep))
            .copied()
            .collect();
        for dep in &wired {
            if let Some(prerequisite) = self.tasks.get_mut(dep) {
                prerequisite.blocks.insert(task_id);
            }
        }
        self.tasks.insert(task_id, task);

        if self.has_cycle() {
            for dep in &wired {
                if let Some(prerequisite) = self.tasks.get_mut(dep) {
                    prerequisite.blocks.remove(&task_id);
                }
            }
            self.tasks.remove(&task_id);
            return Err(ConductorError::cyclic_dependency(task_id));
        }

        tracing::trace!(task_id = %task_id, dependencies = wired.len(), "Task added to graph");
        Ok(task_id)
    }

    /// Delete a task and unwire its edges. Dependents are not removed.
    pub fn remove(&mut self, task_id: TaskId) -> Option<Task> {
        let task = self.tasks.remove(&task_id)?;

        for dependent in &task.blocks {
            if let Some(t) = self.tasks.get_mut(dependent) {
                t.depends_on.remove(&task_id);
            }
        }
        for dep in &task.depends_on {
            if let Some(t) = self.tasks.get_mut(dep) {
                t.blocks.remove(&task_id);
            }
        }

        Some(task)
    }

    /// Queued tasks whose every dependency is present and Completed.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|task| task.state() == TaskState::Queued && self.dependencies_met(task))
            .map(|task| task.id)
            .collect()
    }

    fn dependencies_met(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|t| t.state() == TaskState::Completed)
        })
    }

    /// Three-color depth-first search over `blocks`.
    pub fn has_cycle(&self) -> bool {
        let mut marks: HashMap<TaskId, Mark> = HashMap::with_capacity(self.tasks.len());

        for &start in self.tasks.keys() {
            if marks.contains_key(&start) {
                continue;
            }

            marks.insert(start, Mark::Gray);
            let mut stack = vec![(start, self.successors(start), 0usize)];

            while let Some((node, next, cursor)) = stack.last_mut() {
                if let Some(&child) = next.get(*cursor) {
                    *cursor += 1;
                    match marks.get(&child) {
                        Some(Mark::Gray) => return true,
                        Some(Mark::Black) => {}
                        None => {
                            marks.insert(child, Mark::Gray);
                            let successors = self.successors(child);
                            stack.push((child, successors, 0));
                        }
                    }
                } else {
                    marks.insert(*node, Mark::Black);
                    stack.pop();
                }
            }
        }

        false
    }

    fn successors(&self, task_id: TaskId) -> Vec<TaskId> {
        self.tasks
            .get(&task_id)
            .map(|t| t.blocks.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Dependency-first ordering from a depth-first postorder over `depends_on`.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let mut order = Vec::with_capacity(self.tasks.len());
        let mut marks: HashMap<TaskId, Mark> = HashMap::with_capacity(self.tasks.len());

        for start in self.sorted_ids() {
            if marks.contains_key(&start) {
                continue;
            }

            marks.insert(start, Mark::Gray);
            let mut stack = vec![(start, self.prerequisites(start), 0usize)];

            while let Some((node, deps, cursor)) = stack.last_mut() {
                if let Some(&dep) = deps.get(*cursor) {
                    *cursor += 1;
                    match marks.get(&dep) {
                        Some(Mark::Gray) => return Err(ConductorError::cyclic_dependency(dep)),
                        Some(Mark::Black) => {}
                        None => {
                            marks.insert(dep, Mark::Gray);
                            let prerequisites = self.prerequisites(dep);
                            stack.push((dep, prerequisites, 0));
                        }
                    }
                } else {
                    let done = *node;
                    marks.insert(done, Mark::Black);
                    order.push(done);
                    stack.pop();
                }
            }
        }

        Ok(order)
    }

    fn prerequisites(&self, task_id: TaskId) -> Vec<TaskId> {
        self.tasks
            .get(&task_id)
            .map(|t| {
                t.depends_on
                    .iter()
                    .filter(|dep| self.tasks.contains_key(dep))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn sorted_ids(&self) -> BTreeSet<TaskId> {
        self.tasks.keys().copied().collect()
    }

    /// Every task reachable from `task_id` through `blocks`, nearest first.
    pub fn transitive_dependents(&self, task_id: TaskId) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        let mut queue: VecDeque<TaskId> = self.successors(task_id).into();

        while let Some(next) = queue.pop_front() {
            if next == task_id || !seen.insert(next) {
                continue;
            }
            result.push(next);
            queue.extend(self.successors(next));
        }

        result
    }

    /// Drop the edge `dependency -> task_id`. Returns false if it did not exist.
    pub fn remove_dependency(&mut self, task_id: TaskId, dependency: TaskId) -> bool {
        let removed = match self.tasks.get_mut(&task_id) {
            Some(task) => task.depends_on.remove(&dependency),
            None => false,
        };
        if removed {
            if let Some(dep) = self.tasks.get_mut(&dependency) {
                dep.blocks.remove(&task_id);
            }
        }
        removed
    }

    /// Point `task_id` at `replacement` instead of `previous`.
    pub fn replace_dependency(
        &mut self,
        task_id: TaskId,
        previous: TaskId,
        replacement: TaskId,
    ) -> Result<()> {
        if !self.tasks.contains_key(&task_id) {
            return Err(ConductorError::task_not_found(task_id));
        }
        if task_id == replacement {
            return Err(ConductorError::cyclic_dependency(task_id));
        }

        let had_previous = self.remove_dependency(task_id, previous);
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.depends_on.insert(replacement);
        }
        if let Some(dep) = self.tasks.get_mut(&replacement) {
            dep.blocks.insert(task_id);
        }

        if self.has_cycle() {
            self.remove_dependency(task_id, replacement);
            if had_previous {
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.depends_on.insert(previous);
                }
                if let Some(dep) = self.tasks.get_mut(&previous) {
                    dep.blocks.insert(task_id);
                }
            }
            return Err(ConductorError::cyclic_dependency(replacement));
        }

        Ok(())
    }

    /// Apply a validated state transition to a task in the graph.
    pub fn transition(&mut self, task_id: TaskId, to: TaskState) -> Result<()> {
        self.tasks
            .get_mut(&task_id)
            .ok_or_else(|| ConductorError::task_not_found(task_id))?
            .transition(to)
    }

    pub fn get(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.get(&task_id)
    }

    /// Mutable access for payload and outcome updates. Edges must go through
    /// the graph methods.
    pub(crate) fn get_mut(&mut self, task_id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&task_id)
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.tasks.contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Count tasks by state.
    pub fn stats(&self) -> GraphStats {
        let mut stats = GraphStats {
            total: self.tasks.len(),
            ..Default::default()
        };

        for task in self.tasks.values() {
            match task.state() {
                TaskState::Created => stats.created += 1,
                TaskState::Queued => stats.queued += 1,
                TaskState::Ready => stats.ready += 1,
                TaskState::Running => stats.running += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::Failed => stats.failed += 1,
                TaskState::Cancelled => stats.cancelled += 1,
            }
        }

        stats
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GraphStats {
    pub total: usize,
    pub created: usize,
    pub queued: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

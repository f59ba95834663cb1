//! Graph-wide orderings and diagnostics.

use petgraph::dot::{Config as DotConfig, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::{DependencyGraph, TaskId};
use crate::error::{ConductorError, Result};

/// Longest estimated chain of dependent tasks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CriticalPath {
    /// Tasks on the path, first prerequisite first
    pub tasks: Vec<TaskId>,
    /// Sum of the estimates along the path
    pub estimated: Duration,
}

impl DependencyGraph {
    /// Partition every task into ordered batches.
    ///
    /// Batch `k` holds exactly the tasks whose in-graph dependencies all sit in
    /// batches `0..k`. Dependencies on tasks outside the graph are treated as
    /// already satisfied.
    pub fn execution_batches(&self) -> Result<Vec<Vec<TaskId>>> {
        let mut remaining = self.sorted_ids();
        let mut placed: HashSet<TaskId> = HashSet::with_capacity(remaining.len());
        let mut batches = Vec::new();

        while !remaining.is_empty() {
            let batch: Vec<TaskId> = remaining
                .iter()
                .copied()
                .filter(|id| {
                    self.get(*id).is_some_and(|task| {
                        task.depends_on
                            .iter()
                            .all(|dep| placed.contains(dep) || !self.contains(*dep))
                    })
                })
                .collect();

            if batch.is_empty() {
                return Err(ConductorError::internal(format!(
                    "dependency graph has {} unplaceable tasks; cycle escaped insertion check",
                    remaining.len()
                )));
            }

            for id in &batch {
                remaining.remove(id);
            }
            placed.extend(batch.iter().copied());
            batches.push(batch);
        }

        Ok(batches)
    }

    /// Longest weighted path using per-kind estimates scaled by priority.
    ///
    /// Diagnostic only; scheduling never consults it.
    pub fn critical_path(&self) -> Result<CriticalPath> {
        let order = self.topological_order()?;
        let mut finish: HashMap<TaskId, Duration> = HashMap::with_capacity(order.len());
        let mut previous: HashMap<TaskId, TaskId> = HashMap::new();

        for id in &order {
            let Some(task) = self.get(*id) else { continue };
            let estimate = task
                .kind
                .estimated_duration()
                .mul_f64(task.priority.duration_multiplier());

            let longest_dep = task
                .depends_on
                .iter()
                .filter_map(|dep| finish.get(dep).map(|done| (*dep, *done)))
                .max_by_key(|(_, done)| *done);

            let start = match longest_dep {
                Some((dep, done)) => {
                    previous.insert(*id, dep);
                    done
                }
                None => Duration::ZERO,
            };
            finish.insert(*id, start + estimate);
        }

        let Some((&end, &estimated)) = finish.iter().max_by_key(|(_, done)| **done) else {
            return Ok(CriticalPath::default());
        };

        let mut tasks = vec![end];
        let mut cursor = end;
        while let Some(&prev) = previous.get(&cursor) {
            tasks.push(prev);
            cursor = prev;
        }
        tasks.reverse();

        Ok(CriticalPath { tasks, estimated })
    }

    /// Render the graph in Graphviz DOT format, edges pointing at dependents.
    pub fn to_dot(&self) -> String {
        let mut graph: DiGraph<String, &str> = DiGraph::new();
        let mut index: HashMap<TaskId, NodeIndex> = HashMap::new();

        for id in self.sorted_ids() {
            if let Some(task) = self.get(id) {
                let node = graph.add_node(format!("{} [{}]", task.name, task.state()));
                index.insert(id, node);
            }
        }
        for task in self.tasks() {
            for dependent in task.blocks() {
                if let (Some(&from), Some(&to)) = (index.get(&task.id), index.get(dependent)) {
                    graph.add_edge(from, to, "");
                }
            }
        }

        format!("{}", Dot::with_config(&graph, &[DotConfig::EdgeNoLabel]))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Priority, Task, TaskKind};
    use super::*;

    #[test]
    fn test_empty_graph() {
        let graph = DependencyGraph::new();
        assert!(graph.execution_batches().unwrap().is_empty());
        assert_eq!(graph.critical_path().unwrap(), CriticalPath::default());
    }

    #[test]
    fn test_batches_for_diamond() {
        let mut graph = DependencyGraph::new();
        let a = graph.add(Task::new("a", TaskKind::SingleAgent)).unwrap();
        let b = graph.add(Task::new("b", TaskKind::SingleAgent).with_dependency(a)).unwrap();
        let c = graph.add(Task::new("c", TaskKind::SingleAgent).with_dependency(a)).unwrap();
        let d = graph
            .add(Task::new("d", TaskKind::SingleAgent).with_dependencies([b, c]))
            .unwrap();

        let batches = graph.execution_batches().unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], vec![a]);
        assert_eq!(batches[1].len(), 2);
        assert_eq!(batches[2], vec![d]);
    }

    #[test]
    fn test_critical_path_prefers_heavier_branch() {
        let mut graph = DependencyGraph::new();
        let root = graph.add(Task::new("root", TaskKind::Housekeeping)).unwrap();
        let quick = graph
            .add(Task::new("quick", TaskKind::Monitoring).with_dependency(root))
            .unwrap();
        let slow = graph
            .add(Task::new("slow", TaskKind::Swarm).with_dependency(root))
            .unwrap();

        let path = graph.critical_path().unwrap();
        assert_eq!(path.tasks, vec![root, slow]);
        assert_eq!(path.estimated, Duration::from_secs(30 + 900));
        assert!(!path.tasks.contains(&quick));
    }

    #[test]
    fn test_critical_path_priority_multiplier() {
        let mut graph = DependencyGraph::new();
        graph
            .add(Task::new("urgent", TaskKind::SingleAgent).with_priority(Priority::Critical))
            .unwrap();

        let path = graph.critical_path().unwrap();
        assert_eq!(path.estimated, Duration::from_secs(150));
    }

    #[test]
    fn test_dot_export() {
        let mut graph = DependencyGraph::new();
        let a = graph.add(Task::new("fetch", TaskKind::SingleAgent)).unwrap();
        graph
            .add(Task::new("summarize", TaskKind::Analysis).with_dependency(a))
            .unwrap();

        let dot = graph.to_dot();
        assert!(dot.contains("digraph"));
        assert!(dot.contains("fetch [created]"));
        assert!(dot.contains("->"));
    }
}

//! Integration tests for the dependency graph.

use conductor_core::dag::{DependencyGraph, Priority, Task, TaskId, TaskKind, TaskState};
use conductor_core::ErrorCode;
use std::collections::HashSet;

fn task(name: &str) -> Task {
    Task::new(name, TaskKind::SingleAgent)
}

fn queued(name: &str) -> Task {
    let mut task = task(name);
    task.transition(TaskState::Queued).unwrap();
    task
}

fn complete(graph: &mut DependencyGraph, id: TaskId) {
    graph.transition(id, TaskState::Ready).unwrap();
    graph.transition(id, TaskState::Running).unwrap();
    graph.transition(id, TaskState::Completed).unwrap();
}

#[test]
fn test_empty_graph() {
    let graph = DependencyGraph::new();
    assert!(graph.is_empty());
    assert!(graph.ready_tasks().is_empty());
    assert!(graph.execution_batches().unwrap().is_empty());
    assert!(!graph.has_cycle());
}

#[test]
fn test_linear_dependency_chain() {
    let mut graph = DependencyGraph::new();

    // A -> B -> C
    let a = graph.add(queued("A")).unwrap();
    let b = graph.add(queued("B").with_dependency(a)).unwrap();
    let c = graph.add(queued("C").with_dependency(b)).unwrap();

    assert_eq!(graph.ready_tasks(), vec![a]);

    complete(&mut graph, a);
    assert_eq!(graph.ready_tasks(), vec![b]);

    complete(&mut graph, b);
    assert_eq!(graph.ready_tasks(), vec![c]);

    assert_eq!(graph.topological_order().unwrap(), vec![a, b, c]);
}

#[test]
fn test_diamond_batches() {
    //     A
    //    / \
    //   B   C
    //    \ /
    //     D
    let mut graph = DependencyGraph::new();
    let a = graph.add(queued("A")).unwrap();
    let b = graph.add(queued("B").with_dependency(a)).unwrap();
    let c = graph.add(queued("C").with_dependency(a)).unwrap();
    let d = graph.add(queued("D").with_dependencies([b, c])).unwrap();

    let batches = graph.execution_batches().unwrap();
    assert_eq!(batches.len(), 3);
    assert_eq!(batches[0], vec![a]);
    assert_eq!(batches[1].iter().copied().collect::<HashSet<_>>(), HashSet::from([b, c]));
    assert_eq!(batches[2], vec![d]);

    complete(&mut graph, a);
    let ready: HashSet<_> = graph.ready_tasks().into_iter().collect();
    assert_eq!(ready, HashSet::from([b, c]));
}

#[test]
fn test_batches_respect_every_edge() {
    let mut graph = DependencyGraph::new();
    let mut ids = Vec::new();
    for i in 0..20 {
        let mut t = queued(&format!("t{i}"));
        if i >= 2 {
            t = t.with_dependencies([ids[i - 1], ids[i / 2]]);
        }
        ids.push(graph.add(t).unwrap());
    }

    let batches = graph.execution_batches().unwrap();
    let batch_of = |id: TaskId| batches.iter().position(|b| b.contains(&id)).unwrap();
    assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), ids.len());

    for id in &ids {
        let t = graph.get(*id).unwrap();
        for dep in &t.depends_on {
            assert!(batch_of(*dep) < batch_of(*id));
        }
    }
}

#[test]
fn test_cycle_is_rejected_and_graph_unchanged() {
    let mut graph = DependencyGraph::new();
    let mut a = queued("A");
    let b = graph.add(queued("B").with_dependency(a.id)).unwrap();
    a.depends_on.insert(b);

    let before = graph.len();
    let err = graph.add(a).unwrap_err();
    assert_eq!(err.code(), ErrorCode::CyclicDependency);
    assert_eq!(graph.len(), before);
    assert!(graph.get(b).unwrap().blocks().is_empty());
    assert!(!graph.has_cycle());
}

#[test]
fn test_self_dependency_is_rejected() {
    let mut graph = DependencyGraph::new();
    let mut t = queued("self");
    let id = t.id;
    t.depends_on.insert(id);
    assert_eq!(graph.add(t).unwrap_err().code(), ErrorCode::CyclicDependency);
    assert!(graph.is_empty());
}

#[test]
fn test_forward_reference_is_wired_later() {
    let mut graph = DependencyGraph::new();
    let mut upstream = queued("upstream");
    let upstream_id = TaskId::new();
    upstream.id = upstream_id;

    let downstream = graph.add(queued("downstream").with_dependency(upstream_id)).unwrap();
    assert!(graph.ready_tasks().is_empty());

    graph.add(upstream).unwrap();
    assert!(graph.get(upstream_id).unwrap().blocks().contains(&downstream));
    assert_eq!(graph.ready_tasks(), vec![upstream_id]);
}

#[test]
fn test_remove_releases_dependents() {
    let mut graph = DependencyGraph::new();
    let a = graph.add(queued("A")).unwrap();
    let b = graph.add(queued("B").with_dependency(a)).unwrap();

    complete(&mut graph, a);
    let removed = graph.remove(a).unwrap();
    assert_eq!(removed.state(), TaskState::Completed);
    assert!(graph.get(b).unwrap().depends_on.is_empty());
    assert_eq!(graph.ready_tasks(), vec![b]);
}

#[test]
fn test_transitive_dependents() {
    let mut graph = DependencyGraph::new();
    let a = graph.add(queued("A")).unwrap();
    let b = graph.add(queued("B").with_dependency(a)).unwrap();
    let c = graph.add(queued("C").with_dependency(b)).unwrap();
    let unrelated = graph.add(queued("X")).unwrap();

    let dependents: HashSet<_> = graph.transitive_dependents(a).into_iter().collect();
    assert_eq!(dependents, HashSet::from([b, c]));
    assert!(!dependents.contains(&unrelated));
    assert!(graph.transitive_dependents(TaskId::new()).is_empty());
}

#[test]
fn test_invalid_transition_is_rejected() {
    let mut graph = DependencyGraph::new();
    let id = graph.add(queued("A")).unwrap();
    let err = graph.transition(id, TaskState::Completed).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
    assert_eq!(graph.get(id).unwrap().state(), TaskState::Queued);
}

#[test]
fn test_critical_path_and_dot() {
    let mut graph = DependencyGraph::new();
    let a = graph.add(Task::new("fetch", TaskKind::Monitoring)).unwrap();
    let b = graph
        .add(Task::new("review", TaskKind::Swarm).with_dependency(a).with_priority(Priority::Low))
        .unwrap();
    graph.add(Task::new("note", TaskKind::Housekeeping).with_dependency(a)).unwrap();

    let path = graph.critical_path().unwrap();
    assert_eq!(path.tasks, vec![a, b]);

    let dot = graph.to_dot();
    assert!(dot.contains("digraph"));
    assert!(dot.contains("review [created]"));
}

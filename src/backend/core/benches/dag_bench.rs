//! Benchmarks for the dependency graph and queue dispatch.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use conductor_core::dag::{DependencyGraph, Task, TaskId, TaskKind, TaskState};
use conductor_core::executor::from_fn;
use conductor_core::scheduler::TaskQueue;
use serde_json::Value;

fn queued(name: String) -> Task {
    let mut task = Task::new(name, TaskKind::SingleAgent);
    task.transition(TaskState::Queued).unwrap();
    task
}

fn build_linear(n: usize) -> (DependencyGraph, Vec<TaskId>) {
    let mut graph = DependencyGraph::new();
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let mut task = queued(format!("task-{i}"));
        if let Some(&prev) = ids.last() { task = task.with_dependency(prev); }
        ids.push(graph.add(task).unwrap());
    }
    (graph, ids)
}

fn build_fanout(fan: usize) -> (DependencyGraph, Vec<TaskId>) {
    let mut graph = DependencyGraph::new();
    let root = graph.add(queued("root".into())).unwrap();
    let mut ids = vec![root];
    for i in 0..fan {
        ids.push(graph.add(queued(format!("child-{i}")).with_dependency(root)).unwrap());
    }
    (graph, ids)
}

fn build_layered(layers: usize, width: usize) -> (DependencyGraph, Vec<TaskId>) {
    let mut graph = DependencyGraph::new();
    let mut prev_layer: Vec<TaskId> = Vec::new();
    let mut all_ids = Vec::new();
    for l in 0..layers {
        let mut current_layer = Vec::with_capacity(width);
        for w in 0..width {
            let task = queued(format!("L{l}-W{w}")).with_dependencies(prev_layer.iter().copied());
            let id = graph.add(task).unwrap();
            current_layer.push(id);
            all_ids.push(id);
        }
        prev_layer = current_layer;
    }
    (graph, all_ids)
}

fn bench_graph_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_construction");
    for size in [10, 100, 1_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("linear", size), &size, |b, &n| { b.iter(|| black_box(build_linear(n))); });
        group.bench_with_input(BenchmarkId::new("fanout", size), &size, |b, &n| { b.iter(|| black_box(build_fanout(n))); });
    }
    group.finish();
}

fn bench_execution_batches(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution_batches");
    for size in [10, 100, 1_000] {
        group.bench_with_input(BenchmarkId::new("linear", size), &size, |b, &n| { let (graph, _) = build_linear(n); b.iter(|| black_box(graph.execution_batches().unwrap())); });
        group.bench_with_input(BenchmarkId::new("fanout", size), &size, |b, &n| { let (graph, _) = build_fanout(n); b.iter(|| black_box(graph.execution_batches().unwrap())); });
    }
    for (layers, width) in [(5, 20), (10, 10), (20, 5)] {
        let label = format!("{layers}x{width}");
        group.bench_with_input(BenchmarkId::new("layered", &label), &(layers, width), |b, &(l, w)| { let (graph, _) = build_layered(l, w); b.iter(|| black_box(graph.execution_batches().unwrap())); });
    }
    group.finish();
}

fn bench_ready_tasks(c: &mut Criterion) {
    let mut group = c.benchmark_group("ready_tasks");
    for fan in [10, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(fan), &fan, |b, &n| {
            let (mut graph, ids) = build_fanout(n);
            graph.transition(ids[0], TaskState::Ready).unwrap();
            graph.transition(ids[0], TaskState::Running).unwrap();
            graph.transition(ids[0], TaskState::Completed).unwrap();
            b.iter(|| black_box(graph.ready_tasks()));
        });
    }
    group.finish();
}

fn bench_transitive_dependents(c: &mut Criterion) {
    let mut group = c.benchmark_group("transitive_dependents");
    for depth in [10, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &n| { let (graph, ids) = build_linear(n); b.iter(|| black_box(graph.transitive_dependents(ids[0]))); });
    }
    group.finish();
}

fn bench_queue_throughput(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("queue_throughput");
    group.sample_size(10);
    for tasks in [100, 1_000] {
        group.throughput(Throughput::Elements(tasks as u64));
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &n| {
            b.to_async(&runtime).iter(|| async move {
                let queue = TaskQueue::builder()
                    .max_concurrency(16)
                    .executor(TaskKind::SingleAgent, from_fn(|_task, _ctx| async move { Ok(Value::Null) }))
                    .build();
                for i in 0..n { queue.enqueue(Task::new(format!("t-{i}"), TaskKind::SingleAgent)).unwrap(); }
                queue.wait_idle().await;
                black_box(queue.queue_status())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_graph_construction, bench_execution_batches, bench_ready_tasks, bench_transitive_dependents, bench_queue_throughput);
criterion_main!(benches);

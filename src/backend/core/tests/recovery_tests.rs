//! Restart recovery across orchestrator instances sharing a file store.

use conductor_core::config::Config;
use conductor_core::dag::{Task, TaskKind, TaskState};
use conductor_core::executor::{from_fn, ExecutionError, Executor};
use conductor_core::orchestrator::Orchestrator;
use conductor_core::scheduler::TaskEvent;
use conductor_core::store::{FileStore, TaskStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn config() -> Config {
    let mut config = Config::default();
    config.scheduler.shutdown_grace = Duration::from_millis(50);
    config
}

fn blocking() -> Arc<dyn Executor> {
    from_fn(|_task, ctx| async move {
        ctx.cancelled().await;
        Err(ExecutionError::cancelled())
    })
}

fn echo() -> Arc<dyn Executor> {
    from_fn(|task, _ctx| async move { Ok(json!({ "name": task.name })) })
}

async fn orchestrator(store: &FileStore, executor: Arc<dyn Executor>) -> Orchestrator {
    Orchestrator::builder(config())
        .store(Arc::new(store.clone()))
        .executor(TaskKind::SingleAgent, executor)
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_interrupted_chain_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).await.unwrap();

    let first = orchestrator(&store, blocking()).await;
    first.start().await.unwrap();
    let mut events = first.subscribe();

    let extract = first.submit(first.task("extract", TaskKind::SingleAgent)).unwrap();
    let load = first
        .submit(first.task("load", TaskKind::SingleAgent).with_dependency(extract))
        .unwrap();
    loop {
        if let TaskEvent::Started { task_id, .. } = events.recv().await.unwrap() {
            if task_id == extract {
                break;
            }
        }
    }
    first.shutdown().await.unwrap();

    assert_eq!(store.load(extract).await.unwrap().unwrap().state(), TaskState::Running);
    assert_eq!(store.load(load).await.unwrap().unwrap().state(), TaskState::Queued);

    let second = orchestrator(&store, echo()).await;
    let report = second.start().await.unwrap();
    assert_eq!(report.recovered, 2);
    assert_eq!(report.orphaned, 0);

    let loaded = second.wait_for(load).await.unwrap();
    assert_eq!(loaded.state(), TaskState::Completed);
    assert_eq!(loaded.upstream_result(extract), Some(&json!({"name": "extract"})));

    second.shutdown().await.unwrap();
    assert!(store.load_incomplete().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_completed_work_is_not_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).await.unwrap();

    let first = orchestrator(&store, echo()).await;
    first.start().await.unwrap();
    let id = first.submit(Task::new("once", TaskKind::SingleAgent)).unwrap();
    first.wait_for(id).await.unwrap();
    first.shutdown().await.unwrap();

    let second = orchestrator(&store, echo()).await;
    let report = second.start().await.unwrap();
    assert_eq!(report.recovered, 0);

    let stored = second.get(id).await.unwrap().unwrap();
    assert_eq!(stored.state(), TaskState::Completed);
    assert_eq!(stored.result(), Some(&json!({"name": "once"})));
}

#[tokio::test]
async fn test_unreadable_record_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).await.unwrap();
    std::fs::write(dir.path().join("garbage.json"), b"{ truncated").unwrap();

    let pending = Task::new("pending", TaskKind::SingleAgent);
    store.save(&pending).await.unwrap();

    let orchestrator = orchestrator(&store, echo()).await;
    let report = orchestrator.start().await.unwrap();
    assert_eq!(report.recovered, 1);

    let task = orchestrator.wait_for(pending.id).await.unwrap();
    assert_eq!(task.state(), TaskState::Completed);
}

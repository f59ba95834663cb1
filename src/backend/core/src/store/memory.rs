use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use super::{is_incomplete, TaskStore};
use crate::dag::{Task, TaskId};
use crate::error::Result;

/// Process-local store. Records survive a queue restart but not a process exit.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<DashMap<TaskId, Task>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn save(&self, task: &Task) -> Result<()> {
        self.records.insert(task.id, task.clone());
        Ok(())
    }

    async fn load(&self, task_id: TaskId) -> Result<Option<Task>> {
        Ok(self.records.get(&task_id).map(|entry| entry.value().clone()))
    }

    async fn load_incomplete(&self) -> Result<Vec<Task>> {
        Ok(self
            .records
            .iter()
            .filter(|entry| is_incomplete(entry.value().state()))
            .map(|entry| entry.value().clone())
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{TaskKind, TaskState};

    #[tokio::test]
    async fn test_save_overwrites() {
        let store = MemoryStore::new();
        let mut task = Task::new("a", TaskKind::SingleAgent);
        store.save(&task).await.unwrap();

        task.transition(TaskState::Queued).unwrap();
        store.save(&task).await.unwrap();

        assert_eq!(store.len(), 1);
        let loaded = store.load(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.state(), TaskState::Queued);
        assert!(store.load(TaskId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_incomplete_filters_settled() {
        let store = MemoryStore::new();
        let open = Task::new("open", TaskKind::SingleAgent);
        let mut done = Task::new("done", TaskKind::SingleAgent);
        done.cancel("not needed").unwrap();

        store.save(&open).await.unwrap();
        store.save(&done).await.unwrap();

        let incomplete = store.load_incomplete().await.unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, open.id);
    }
}

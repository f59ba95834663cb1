//! Durable task records for crash recovery.
//!
//! A [`TaskStore`] keeps the latest snapshot of every task, keyed by id.
//! Writes are idempotent upserts, so the scheduler may retry them freely.
//! The scheduler never writes to a store directly; it queues snapshots on a
//! [`PersistenceWriter`] that applies them in order on a background task.

mod file;
mod memory;
mod redis;
mod writer;

pub use self::file::FileStore;
pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::writer::{PersistenceHealth, PersistenceWriter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::dag::{Task, TaskId, TaskState};
use crate::error::Result;

/// Storage contract for task snapshots.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or overwrite the record for `task.id`.
    async fn save(&self, task: &Task) -> Result<()>;

    /// Load one record. Malformed records fail with `CorruptRecord`.
    async fn load(&self, task_id: TaskId) -> Result<Option<Task>>;

    /// Every record whose state is neither Completed nor Cancelled.
    ///
    /// Malformed records are logged and skipped so one bad entry cannot block
    /// startup.
    async fn load_incomplete(&self) -> Result<Vec<Task>>;

    /// Backend name for logs and metrics.
    fn name(&self) -> &'static str;
}

/// Whether a record should be re-admitted after a restart.
pub fn is_incomplete(state: TaskState) -> bool {
    !matches!(state, TaskState::Completed | TaskState::Cancelled)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    File,
    Redis,
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: StoreBackend,
    /// Directory for the file backend
    pub path: PathBuf,
    pub redis_url: String,
    /// Key namespace for the redis backend
    pub key_prefix: String,
    /// Attempts per write before it is reported as failed
    pub write_attempts: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: PathBuf::from("data/tasks"),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "conductor".to_string(),
            write_attempts: 3,
        }
    }
}

/// Build the configured store.
pub async fn from_config(config: &PersistenceConfig) -> Result<Arc<dyn TaskStore>> {
    let store: Arc<dyn TaskStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::File => Arc::new(FileStore::open(&config.path).await?),
        StoreBackend::Redis => Arc::new(RedisStore::connect(&config.redis_url, &config.key_prefix)?),
    };
    tracing::info!(backend = store.name(), "Task store ready");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_states() {
        let incomplete: Vec<TaskState> = TaskState::ALL
            .into_iter()
            .filter(|s| is_incomplete(*s))
            .collect();
        assert_eq!(
            incomplete,
            vec![
                TaskState::Created,
                TaskState::Queued,
                TaskState::Ready,
                TaskState::Running,
                TaskState::Failed,
            ]
        );
    }

    #[tokio::test]
    async fn test_from_config_memory() {
        let store = from_config(&PersistenceConfig::default()).await.unwrap();
        assert_eq!(store.name(), "memory");
    }
}

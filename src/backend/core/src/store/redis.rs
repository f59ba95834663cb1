use async_trait::async_trait;

use super::{is_incomplete, TaskStore};
use crate::dag::{Task, TaskId};
use crate::error::{ConductorError, ErrorCode, Result};

/// Redis-backed store.
///
/// Each task is a JSON string at `<prefix>:task:<id>`. Ids of incomplete tasks
/// are kept in the set `<prefix>:incomplete`, updated in the same transaction
/// as the record.
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("prefix", &self.prefix).finish()
    }
}

impl RedisStore {
    /// Create a store for `url`. No connection is made until first use.
    pub fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            ConductorError::with_internal(
                ErrorCode::InvalidConfiguration,
                "Invalid redis url for task store",
                e.to_string(),
            )
        })?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }

    fn record_key(&self, task_id: TaskId) -> String {
        format!("{}:task:{}", self.prefix, task_id)
    }

    fn index_key(&self) -> String {
        format!("{}:incomplete", self.prefix)
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await.map_err(|e| {
            ConductorError::with_internal(
                ErrorCode::StoreConnectionFailed,
                "Failed to get Redis connection for task store",
                e.to_string(),
            )
        })
    }
}

#[async_trait]
impl TaskStore for RedisStore {
    async fn save(&self, task: &Task) -> Result<()> {
        let serialized = serde_json::to_string(task)?;
        let index_op = if is_incomplete(task.state()) { "SADD" } else { "SREM" };

        let mut conn = self.get_conn().await?;
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.record_key(task.id))
            .arg(&serialized)
            .ignore()
            .cmd(index_op)
            .arg(self.index_key())
            .arg(task.id.to_string())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        tracing::trace!(task_id = %task.id, state = %task.state(), "Task record written");
        Ok(())
    }

    async fn load(&self, task_id: TaskId) -> Result<Option<Task>> {
        let key = self.record_key(task_id);
        let mut conn = self.get_conn().await?;
        let value: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;

        value
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| ConductorError::corrupt_record(key, e.to_string()))
            })
            .transpose()
    }

    async fn load_incomplete(&self) -> Result<Vec<Task>> {
        let mut conn = self.get_conn().await?;
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.index_key())
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| format!("{}:task:{}", self.prefix, id)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut tasks = Vec::with_capacity(values.len());
        for (key, value) in keys.iter().zip(values) {
            let Some(raw) = value else {
                tracing::warn!(key = %key, "Indexed task record is missing");
                continue;
            };
            match serde_json::from_str::<Task>(&raw) {
                Ok(task) if is_incomplete(task.state()) => tasks.push(task),
                Ok(_) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping unreadable task record"),
            }
        }
        Ok(tasks)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

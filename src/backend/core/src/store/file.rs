use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::{is_incomplete, TaskStore};
use crate::dag::{Task, TaskId};
use crate::error::{ConductorError, Result};

/// One JSON document per task under a directory.
///
/// Writes go to a temporary file that is renamed over the record, so readers
/// never observe a partially written document.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) the store directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|e| {
            ConductorError::persistence(format!("cannot create store directory {}", dir.display()))
                .with_source(e)
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, task_id: TaskId) -> PathBuf {
        self.dir.join(format!("{}.json", task_id))
    }

    async fn read_record(path: &Path) -> Result<Option<Task>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ConductorError::corrupt_record(path.display().to_string(), e.to_string()))
    }
}

#[async_trait]
impl TaskStore for FileStore {
    async fn save(&self, task: &Task) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(task)?;
        let path = self.record_path(task.id);
        let tmp = self.dir.join(format!(".{}.json.tmp", task.id));

        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, task_id: TaskId) -> Result<Option<Task>> {
        Self::read_record(&self.record_path(task_id)).await
    }

    async fn load_incomplete(&self) -> Result<Vec<Task>> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut tasks = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(task)) if is_incomplete(task.state()) => tasks.push(task),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable task record");
                }
            }
        }

        Ok(tasks)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

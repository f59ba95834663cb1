//! Background persistence writer.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::TaskStore;
use crate::dag::Task;
use crate::error::{ConductorError, Result};
use crate::scheduler::{RetryPolicy, TaskEvent};
use crate::telemetry::metrics;

/// Backlog depth at which every further multiple is logged as a warning.
const BACKLOG_WARN_STEP: u64 = 1_000;

enum WriteOp {
    Save(Box<Task>),
    Flush(oneshot::Sender<()>),
}

/// Failure and backlog counters shared between the writer and status reporting.
#[derive(Debug, Default)]
pub struct PersistenceHealth {
    failures: AtomicU64,
    backlog: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl PersistenceHealth {
    /// Writes that failed after all attempts.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Snapshots queued but not yet written (or given up on).
    pub fn backlog(&self) -> u64 {
        self.backlog.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn record(&self, error: &ConductorError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.to_string());
    }

    fn queued(&self, store: &'static str) {
        let depth = self.backlog.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::persistence_backlog(store, depth);
        if depth % BACKLOG_WARN_STEP == 0 {
            tracing::warn!(store, backlog = depth, "Persistence writer is falling behind");
        }
    }

    fn written(&self, store: &'static str) {
        let depth = self.backlog.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::persistence_backlog(store, depth);
    }
}

/// Queues task snapshots and applies them to a store in submission order.
///
/// Saves never block the caller: they are taken while the scheduler lock is
/// held, so the channel is unbounded and its depth is reported as
/// [`PersistenceHealth::backlog`] instead. A failed write is retried with backoff and,
/// once attempts run out, counted in [`PersistenceHealth`] and announced as
/// [`TaskEvent::PersistenceFailed`]. Scheduling continues either way.
#[derive(Clone)]
pub struct PersistenceWriter {
    tx: mpsc::UnboundedSender<WriteOp>,
    health: Arc<PersistenceHealth>,
    store_name: &'static str,
}

impl std::fmt::Debug for PersistenceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceWriter")
            .field("store", &self.store_name)
            .field("failures", &self.health.failures())
            .field("backlog", &self.health.backlog())
            .finish()
    }
}

impl PersistenceWriter {
    /// Spawn the writer loop. It exits once every handle is dropped.
    pub fn spawn(
        store: Arc<dyn TaskStore>,
        write_attempts: u32,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let health = Arc::new(PersistenceHealth::default());
        let store_name = store.name();

        tokio::spawn(run(store, rx, write_attempts.max(1), health.clone(), events));

        Self {
            tx,
            health,
            store_name,
        }
    }

    /// Queue a snapshot of `task`.
    pub fn save(&self, task: &Task) {
        if self.tx.send(WriteOp::Save(Box::new(task.clone()))).is_ok() {
            self.health.queued(self.store_name);
        } else {
            let error = ConductorError::persistence("persistence writer has stopped");
            tracing::error!(task_id = %task.id, "Dropping task snapshot, writer has stopped");
            self.health.record(&error);
        }
    }

    /// Resolves once every snapshot queued before this call has been handled.
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriteOp::Flush(done_tx))
            .map_err(|_| ConductorError::persistence("persistence writer has stopped"))?;
        done_rx
            .await
            .map_err(|_| ConductorError::persistence("persistence writer stopped before flushing"))
    }

    pub fn health(&self) -> &PersistenceHealth {
        &self.health
    }

    pub fn store_name(&self) -> &'static str {
        self.store_name
    }
}

async fn run(
    store: Arc<dyn TaskStore>,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    attempts: u32,
    health: Arc<PersistenceHealth>,
    events: broadcast::Sender<TaskEvent>,
) {
    let backoff = RetryPolicy::exponential(Duration::from_millis(50)).with_max_delay(Duration::from_secs(2));

    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Save(task) => {
                if let Err(error) = write_with_retry(store.as_ref(), &task, attempts, &backoff).await {
                    tracing::error!(
                        task_id = %task.id,
                        store = store.name(),
                        error = %error,
                        "Task snapshot could not be persisted"
                    );
                    health.record(&error);
                    metrics::persistence_failure(store.name());
                    let _ = events.send(TaskEvent::PersistenceFailed {
                        task_id: task.id,
                        error: error.to_string(),
                    });
                }
                health.written(store.name());
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    tracing::debug!(store = store.name(), "Persistence writer stopped");
}

async fn write_with_retry(
    store: &dyn TaskStore,
    task: &Task,
    attempts: u32,
    backoff: &RetryPolicy,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        match store.save(task).await {
            Ok(()) => return Ok(()),
            Err(error) if attempt + 1 < attempts => {
                let delay = backoff.delay_for_attempt(attempt);
                tracing::warn!(
                    task_id = %task.id,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Task snapshot write failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

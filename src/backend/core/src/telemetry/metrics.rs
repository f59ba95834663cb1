//! Prometheus metrics for task lifecycle, persistence, and circuit breakers.
//!
//! Recording goes through the `metrics` facade, so it is a no-op until a
//! recorder is installed with [`init_metrics`].
//!
//! # Example
//!
//! ```rust,no_run
//! use conductor_core::telemetry::metrics::TaskMetrics;
//! use conductor_core::dag::TaskKind;
//!
//! TaskMetrics::submitted(TaskKind::Analysis);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::dag::TaskKind;

pub const TASKS_SUBMITTED: &str = "conductor_tasks_submitted_total";
pub const TASKS_STARTED: &str = "conductor_tasks_started_total";
pub const TASKS_COMPLETED: &str = "conductor_tasks_completed_total";
pub const TASKS_FAILED: &str = "conductor_tasks_failed_total";
pub const TASKS_RETRIED: &str = "conductor_tasks_retried_total";
pub const TASKS_CANCELLED: &str = "conductor_tasks_cancelled_total";
pub const FOLLOW_UPS: &str = "conductor_follow_ups_total";
pub const PERSISTENCE_FAILURES: &str = "conductor_persistence_failures_total";
pub const RATE_LIMITED: &str = "conductor_rate_limited_total";
pub const CIRCUIT_TRIPS: &str = "conductor_circuit_breaker_trips_total";
pub const ERRORS: &str = "conductor_errors_total";
pub const TASKS_RUNNING: &str = "conductor_tasks_running";
pub const TASKS_QUEUED: &str = "conductor_tasks_queued";
pub const PERSISTENCE_BACKLOG: &str = "conductor_persistence_backlog";
pub const TASK_DURATION: &str = "conductor_task_duration_seconds";

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether to install the Prometheus exporter
    #[serde(default)]
    pub enabled: bool,

    /// Address the scrape endpoint listens on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Histogram buckets for task durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Labels added to every metric
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_listen(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0]
}

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from within a Tokio runtime. Returns `false` when metrics
/// are disabled.
pub fn init_metrics(config: &MetricsConfig) -> anyhow::Result<bool> {
    if !config.enabled {
        return Ok(false);
    }

    let mut builder = PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .set_buckets(&config.duration_buckets)?;
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder.install()?;

    register_metric_descriptions();

    tracing::info!(listen = %config.listen, "Metrics exporter listening");
    Ok(true)
}

fn register_metric_descriptions() {
    describe_counter!(TASKS_SUBMITTED, "Tasks admitted to the queue");
    describe_counter!(TASKS_STARTED, "Executor attempts started");
    describe_counter!(TASKS_COMPLETED, "Tasks that settled as completed");
    describe_counter!(TASKS_FAILED, "Tasks that settled as failed");
    describe_counter!(TASKS_RETRIED, "Retries scheduled after a failed attempt");
    describe_counter!(TASKS_CANCELLED, "Tasks that settled as cancelled");
    describe_counter!(FOLLOW_UPS, "Follow-up tasks produced by result interpretation");
    describe_counter!(PERSISTENCE_FAILURES, "Store writes that failed after all attempts");
    describe_counter!(RATE_LIMITED, "Dispatches deferred by the rate limiter");
    describe_counter!(CIRCUIT_TRIPS, "Per-kind circuit breaker trips");
    describe_counter!(ERRORS, "Errors by code");
    describe_gauge!(TASKS_RUNNING, "Tasks currently running");
    describe_gauge!(TASKS_QUEUED, "Tasks waiting for dispatch");
    describe_gauge!(PERSISTENCE_BACKLOG, "Task snapshots waiting to be written");
    describe_histogram!(TASK_DURATION, "Executor attempt duration in seconds");
}

/// Task lifecycle metrics.
pub struct TaskMetrics;

impl TaskMetrics {
    pub fn submitted(kind: TaskKind) {
        counter!(TASKS_SUBMITTED, "kind" => kind.to_string()).increment(1);
    }

    pub fn started(kind: TaskKind) {
        counter!(TASKS_STARTED, "kind" => kind.to_string()).increment(1);
    }

    /// Record a finished attempt and its duration.
    pub fn attempt_finished(kind: TaskKind, success: bool, elapsed: Duration) {
        histogram!(
            TASK_DURATION,
            "kind" => kind.to_string(),
            "success" => success.to_string(),
        )
        .record(elapsed.as_secs_f64());
    }

    pub fn completed(kind: TaskKind) {
        counter!(TASKS_COMPLETED, "kind" => kind.to_string()).increment(1);
    }

    pub fn failed(kind: TaskKind) {
        counter!(TASKS_FAILED, "kind" => kind.to_string()).increment(1);
    }

    pub fn retried(kind: TaskKind) {
        counter!(TASKS_RETRIED, "kind" => kind.to_string()).increment(1);
    }

    pub fn cancelled(kind: TaskKind) {
        counter!(TASKS_CANCELLED, "kind" => kind.to_string()).increment(1);
    }

    pub fn follow_up(suggestion: &str) {
        counter!(FOLLOW_UPS, "suggestion" => suggestion.to_string()).increment(1);
    }

    pub fn circuit_tripped(kind: TaskKind) {
        counter!(CIRCUIT_TRIPS, "kind" => kind.to_string()).increment(1);
    }

    /// Queue depth gauges.
    pub fn depth(queued: usize, running: usize) {
        gauge!(TASKS_QUEUED).set(queued as f64);
        gauge!(TASKS_RUNNING).set(running as f64);
    }
}

pub fn persistence_failure(store: &'static str) {
    counter!(PERSISTENCE_FAILURES, "store" => store).increment(1);
}

pub fn persistence_backlog(store: &'static str, depth: u64) {
    gauge!(PERSISTENCE_BACKLOG, "store" => store).set(depth as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_metrics_skip_install() {
        let config = MetricsConfig::default();
        assert!(!config.enabled);
        assert!(!init_metrics(&config).unwrap());
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        TaskMetrics::submitted(TaskKind::Swarm);
        TaskMetrics::attempt_finished(TaskKind::Swarm, true, Duration::from_millis(5));
        TaskMetrics::depth(3, 1);
        persistence_failure("memory");
        persistence_backlog("memory", 4);
    }

    #[test]
    fn test_config_parses_listen_address() {
        let config: MetricsConfig =
            serde_json::from_value(serde_json::json!({"enabled": true, "listen": "127.0.0.1:9100"}))
                .unwrap();
        assert_eq!(config.listen.port(), 9100);
        assert_eq!(config.duration_buckets, default_duration_buckets());
    }
}

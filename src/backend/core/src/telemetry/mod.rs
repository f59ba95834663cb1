//! Telemetry: structured logging and Prometheus metrics.
//!
//! - **Logging**: `tracing-subscriber` with JSON/pretty/compact output and
//!   redaction of sensitive task parameters
//! - **Metrics**: task lifecycle counters, queue gauges and durations via the
//!   `metrics` facade, optionally exported over HTTP for Prometheus
//!
//! # Example
//!
//! ```rust,no_run
//! use conductor_core::telemetry::{init_telemetry, TelemetryConfig};
//!
//! init_telemetry(&TelemetryConfig::default()).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{
    init_logging, redact_parameters, LogFormat, LoggingConfig, RedactionConfig, SensitiveFieldRedactor,
};
pub use metrics::{init_metrics, MetricsConfig, TaskMetrics};

/// Logging and metrics configuration together.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl From<&crate::config::Config> for TelemetryConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            logging: config.logging.clone(),
            metrics: config.metrics.clone(),
        }
    }
}

/// Initialize logging, then metrics. Call once at startup.
///
/// # Errors
///
/// Returns an error if either component fails to initialize.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<()> {
    init_logging(&config.logging)?;

    if init_metrics(&config.metrics)? {
        ::tracing::info!(listen = %config.metrics.listen, "Prometheus exporter listening");
    }

    Ok(())
}

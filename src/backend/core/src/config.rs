//! Configuration management.
//!
//! Values come from an optional file plus `CONDUCTOR__SECTION__KEY`
//! environment variables, environment winning.

use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;

use crate::dag::TaskKind;
use crate::error::{ConductorError, Result};
use crate::executor::CommandSpec;
use crate::interpreter::InterpreterConfig;
use crate::scheduler::{RateLimitConfig, SchedulerConfig};
use crate::store::PersistenceConfig;
use crate::telemetry::{LoggingConfig, MetricsConfig};

const ENV_PREFIX: &str = "CONDUCTOR";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Concurrency, retry, breaker and recovery settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Dispatch rate limit
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Task store backend
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Result interpretation and follow-ups
    #[serde(default)]
    pub interpreter: InterpreterConfig,

    /// Subprocess executors keyed by task kind (`single_agent`, `swarm`, ...)
    #[serde(default)]
    pub executors: HashMap<String, CommandSpec>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from the environment alone.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, overlaid with the environment.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the queue cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrency == 0 {
            return Err(ConductorError::configuration(
                "scheduler.max_concurrency must be at least 1",
            ));
        }
        if !(self.scheduler.retry.multiplier > 0.0) {
            return Err(ConductorError::configuration(format!(
                "scheduler.retry.multiplier must be positive, got {}",
                self.scheduler.retry.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.scheduler.retry.jitter) {
            return Err(ConductorError::configuration(format!(
                "scheduler.retry.jitter must be within 0.0..=1.0, got {}",
                self.scheduler.retry.jitter
            )));
        }
        if self.scheduler.circuit_breaker.enabled && self.scheduler.circuit_breaker.failure_threshold == 0 {
            return Err(ConductorError::configuration(
                "scheduler.circuit_breaker.failure_threshold must be at least 1",
            ));
        }

        for (kind, spec) in &self.executors {
            TaskKind::from_str(kind)?;
            if spec.command.first().map_or(true, |program| program.trim().is_empty()) {
                return Err(ConductorError::configuration(format!(
                    "executors.{}.command must name a program",
                    kind
                )));
            }
        }

        Ok(())
    }
}

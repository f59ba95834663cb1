//! Per-kind circuit breakers.
//!
//! Consecutive execution failures of one task kind open its breaker. While
//! open, dispatch skips tasks of that kind. After the recovery timeout a
//! single trial task is let through; its outcome closes or re-opens the
//! breaker.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::dag::TaskKind;
use crate::telemetry::metrics::TaskMetrics;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Too many failures, dispatch blocked
    Open,
    /// Probing whether the executor recovered
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Consecutive failures that trip the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the breaker stays open before probing
    #[serde(default = "default_recovery_timeout", with = "humantime_serde")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

fn default_enabled() -> bool { true }
fn default_failure_threshold() -> u32 { 5 }
fn default_recovery_timeout() -> Duration { Duration::from_secs(30) }

/// Outcome of asking a breaker whether a task may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Blocked; `retry_after` is how long until the breaker may admit again
    Blocked { retry_after: Option<Duration> },
}

#[derive(Debug)]
struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_started: Option<Instant>,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            trial_started: None,
        }
    }
}

/// One breaker per task kind. Mutated only under the scheduler lock.
#[derive(Debug)]
pub struct KindBreakers {
    config: CircuitBreakerConfig,
    breakers: HashMap<TaskKind, CircuitBreaker>,
}

impl KindBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: HashMap::new(),
        }
    }

    /// Ask whether a task of `kind` may start now. Admitting a half-open
    /// breaker marks the trial as started.
    pub fn admit(&mut self, kind: TaskKind) -> Admission {
        if !self.config.enabled {
            return Admission::Allowed;
        }
        let recovery_timeout = self.config.recovery_timeout;
        let breaker = self.breakers.entry(kind).or_insert_with(CircuitBreaker::new);
        let now = Instant::now();

        match breaker.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let opened_at = breaker.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= recovery_timeout {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.trial_started = Some(now);
                    tracing::info!(kind = %kind, "Circuit breaker half-open, dispatching trial task");
                    Admission::Allowed
                } else {
                    Admission::Blocked {
                        retry_after: Some(recovery_timeout - elapsed),
                    }
                }
            }
            CircuitState::HalfOpen => match breaker.trial_started {
                Some(started) if now.saturating_duration_since(started) < recovery_timeout => {
                    Admission::Blocked {
                        retry_after: Some(recovery_timeout - now.saturating_duration_since(started)),
                    }
                }
                _ => {
                    breaker.trial_started = Some(now);
                    Admission::Allowed
                }
            },
        }
    }

    /// Whether a half-open breaker has a trial task in flight.
    pub fn has_trial_in_flight(&self, kind: TaskKind) -> bool {
        self.breakers
            .get(&kind)
            .is_some_and(|b| b.state == CircuitState::HalfOpen && b.trial_started.is_some())
    }

    /// Forget a trial task that will never report an outcome (cancelled, or never
    /// launched). The next task of `kind` is admitted as the new trial.
    pub fn release_trial(&mut self, kind: TaskKind) {
        if let Some(breaker) = self.breakers.get_mut(&kind) {
            if breaker.state == CircuitState::HalfOpen && breaker.trial_started.take().is_some() {
                tracing::info!(kind = %kind, "Circuit breaker trial released without outcome");
            }
        }
    }

    pub fn record_success(&mut self, kind: TaskKind) {
        if let Some(breaker) = self.breakers.get_mut(&kind) {
            if breaker.state != CircuitState::Closed {
                tracing::info!(kind = %kind, "Circuit breaker closed after successful trial");
            }
            *breaker = CircuitBreaker::new();
        }
    }

    pub fn record_failure(&mut self, kind: TaskKind) {
        if !self.config.enabled {
            return;
        }
        let threshold = self.config.failure_threshold;
        let breaker = self.breakers.entry(kind).or_insert_with(CircuitBreaker::new);

        match breaker.state {
            CircuitState::HalfOpen => {
                breaker.state = CircuitState::Open;
                breaker.opened_at = Some(Instant::now());
                breaker.trial_started = None;
                tracing::warn!(kind = %kind, "Circuit breaker re-opened after failed trial");
            }
            CircuitState::Closed => {
                breaker.failure_count += 1;
                if breaker.failure_count >= threshold {
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = Some(Instant::now());
                    TaskMetrics::circuit_tripped(kind);
                    tracing::warn!(
                        kind = %kind,
                        failures = breaker.failure_count,
                        threshold = threshold,
                        "Circuit breaker opened due to consecutive failures"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self, kind: TaskKind) -> CircuitState {
        self.breakers
            .get(&kind)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Kinds whose breaker is not closed.
    pub fn tripped(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self
            .breakers
            .iter()
            .filter(|(_, b)| b.state != CircuitState::Closed)
            .map(|(kind, _)| *kind)
            .collect();
        kinds.sort_by_key(|k| k.to_string());
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakers(threshold: u32) -> KindBreakers {
        KindBreakers::new(CircuitBreakerConfig {
            enabled: true,
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(30),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let mut breakers = breakers(2);
        let kind = TaskKind::Swarm;

        breakers.record_failure(kind);
        assert_eq!(breakers.admit(kind), Admission::Allowed);

        breakers.record_failure(kind);
        assert_eq!(breakers.state(kind), CircuitState::Open);
        assert_eq!(
            breakers.admit(kind),
            Admission::Blocked { retry_after: Some(Duration::from_secs(30)) }
        );
        assert_eq!(breakers.admit(TaskKind::Analysis), Admission::Allowed);
        assert_eq!(breakers.tripped(), vec![kind]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let mut breakers = breakers(1);
        let kind = TaskKind::SingleAgent;
        breakers.record_failure(kind);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(breakers.admit(kind), Admission::Allowed);
        assert_eq!(breakers.state(kind), CircuitState::HalfOpen);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            breakers.admit(kind),
            Admission::Blocked { retry_after: Some(Duration::from_secs(20)) }
        );

        breakers.record_success(kind);
        assert_eq!(breakers.state(kind), CircuitState::Closed);
        assert_eq!(breakers.admit(kind), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_trial_admits_next_task() {
        let mut breakers = breakers(1);
        let kind = TaskKind::Swarm;
        breakers.record_failure(kind);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(breakers.admit(kind), Admission::Allowed);
        assert!(breakers.has_trial_in_flight(kind));

        breakers.release_trial(kind);
        assert!(!breakers.has_trial_in_flight(kind));
        assert_eq!(breakers.state(kind), CircuitState::HalfOpen);
        assert_eq!(breakers.admit(kind), Admission::Allowed);
        assert!(breakers.has_trial_in_flight(kind));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let mut breakers = breakers(1);
        let kind = TaskKind::Monitoring;
        breakers.record_failure(kind);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breakers.admit(kind), Admission::Allowed);

        breakers.record_failure(kind);
        assert_eq!(breakers.state(kind), CircuitState::Open);
    }

    #[test]
    fn test_disabled_never_blocks() {
        let mut breakers = KindBreakers::new(CircuitBreakerConfig {
            enabled: false,
            ..Default::default()
        });
        for _ in 0..10 {
            breakers.record_failure(TaskKind::Swarm);
        }
        assert_eq!(breakers.admit(TaskKind::Swarm), Admission::Allowed);
    }
}

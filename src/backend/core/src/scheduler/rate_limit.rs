//! Sliding-window rate limiting for executor dispatch.
//!
//! The limiter keeps the instants of accepted requests inside a trailing
//! window. A request is admitted while fewer than `limit` instants remain in
//! the window; otherwise the caller learns how long until the oldest one
//! expires.

use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::telemetry::metrics::RATE_LIMITED;

/// Rate limiting errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    Exceeded { limit: u32, retry_after: Duration },
}

impl RateLimitError {
    pub fn retry_after(&self) -> Duration {
        match self {
            Self::Exceeded { retry_after, .. } => *retry_after,
        }
    }
}

/// Dispatch rate limit. Zero requests per window disables limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 0,
            window: Duration::from_secs(60),
        }
    }
}

/// Sliding-window limiter safe to share between tasks.
#[derive(Debug)]
pub struct RateLimiter {
    /// Requests admitted per window; `None` disables limiting
    limit: Option<u32>,
    window: Duration,
    granted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Admit at most `limit` requests in any trailing `window`.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: (limit > 0).then_some(limit),
            window,
            granted: Mutex::new(VecDeque::with_capacity(limit as usize)),
        }
    }

    /// Admit at most `requests` per trailing 60 seconds.
    pub fn per_minute(requests: u32) -> Self {
        Self::new(requests, Duration::from_secs(60))
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_minute, config.window)
    }

    /// A limiter that admits everything.
    pub fn unlimited() -> Self {
        Self::new(0, Duration::from_secs(60))
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Take a token now or report how long to wait for one.
    ///
    /// Eviction, the check and the append happen under one lock.
    pub fn try_acquire(&self) -> Result<(), RateLimitError> {
        self.admit(true)
    }

    /// Like [`try_acquire`](Self::try_acquire) without taking the token.
    pub fn check(&self) -> Result<(), RateLimitError> {
        self.admit(false)
    }

    fn admit(&self, take: bool) -> Result<(), RateLimitError> {
        let Some(limit) = self.limit else {
            return Ok(());
        };

        let now = Instant::now();
        let mut granted = self.granted.lock();
        Self::evict(&mut granted, now, self.window);

        if granted.len() < limit as usize {
            if take {
                granted.push_back(now);
            }
            return Ok(());
        }

        let retry_after = granted
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or_default();

        counter!(RATE_LIMITED).increment(1);
        Err(RateLimitError::Exceeded { limit, retry_after })
    }

    /// Suspend until a token is available, then take it.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(err) => {
                    tracing::debug!(retry_after_ms = err.retry_after().as_millis() as u64, "Waiting for rate limit token");
                    tokio::time::sleep(err.retry_after()).await;
                }
            }
        }
    }

    /// Tokens that could be taken right now.
    pub fn available(&self) -> Option<u32> {
        let limit = self.limit?;
        let mut granted = self.granted.lock();
        Self::evict(&mut granted, Instant::now(), self.window);
        Some(limit.saturating_sub(granted.len() as u32))
    }

    fn evict(granted: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = granted.front() {
            if now.saturating_duration_since(*oldest) >= window {
                granted.pop_front();
            } else {
                break;
            }
        }
    }
}

//! Retry backoff policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff between execution attempts.
///
/// The delay before retry `n` (0-indexed) is `base_delay * multiplier^n`,
/// capped at `max_delay`, optionally spread by `jitter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for any single delay
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Growth factor per attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Fraction of the delay randomly added or removed (0.0 = none)
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: 0.0,
        }
    }
}

fn default_base_delay() -> Duration { Duration::from_secs(1) }
fn default_max_delay() -> Duration { Duration::from_secs(300) }
fn default_multiplier() -> f64 { 2.0 }

impl RetryPolicy {
    /// Fixed base delay, doubling each attempt.
    pub fn exponential(base_delay: Duration) -> Self {
        Self {
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait given how many retries already happened.
    pub fn delay_for_attempt(&self, retries_so_far: u32) -> Duration {
        let exponent = retries_so_far.min(i32::MAX as u32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            (capped + (rand_simple() * 2.0 - 1.0) * spread).max(0.0)
        } else {
            capped
        };

        Duration::try_from_secs_f64(delay).unwrap_or(self.max_delay)
    }
}

/// Cheap pseudo-random number in `0.0..1.0` for jitter.
fn rand_simple() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    (hasher.finish() as f64) / (u64::MAX as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100));

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::exponential(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(30));

        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::exponential(Duration::from_secs(10)).with_jitter(0.5);

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_secs(5));
            assert!(delay <= Duration::from_secs(15));
        }
    }

    #[test]
    fn test_deserialize_humantime() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"base_delay": "250ms", "max_delay": "1m"}"#).unwrap();
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.multiplier, 2.0);
    }
}

//! Exponential backoff policy, used by the pool to schedule redials of
//! unreachable endpoints.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;

/// Configuration for the backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Number of growing delays before the policy settles at `max_backoff`.
    pub max_retries: u32,
    /// Initial backoff delay.
    #[serde(with = "duration_ms", rename = "initial_backoff_ms")]
    pub initial_backoff: Duration,
    /// Maximum backoff delay (caps exponential growth).
    #[serde(with = "duration_ms", rename = "max_backoff_ms")]
    pub max_backoff: Duration,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
    /// Width of the random window around each delay, as a fraction of it.
    /// Delays land in `backoff * (1 ± jitter_fraction / 2)`, capped at
    /// `max_backoff` (0.0 = no jitter).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 8,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

/// Stateless retry policy: computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let base_ms = self.config.initial_backoff.as_millis() as f64
            * self.config.multiplier.powi((attempt - 1) as i32);
        let cap_ms = self.config.max_backoff.as_millis() as f64;
        let capped = base_ms.min(cap_ms);

        let jitter_range = (capped * self.config.jitter_fraction.clamp(0.0, 1.0)) as u64;
        let offset = if jitter_range > 0 {
            rand::rng().random_range(0..=jitter_range)
        } else {
            0
        };
        let total_ms = ((capped as u64).saturating_sub(jitter_range / 2) + offset).min(cap_ms as u64);

        Some(Duration::from_millis(total_ms))
    }

    /// Delay after `failures` consecutive failures. Never gives up: once the
    /// growing phase is over every further delay is `max_backoff`.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        self.next_delay(failures)
            .unwrap_or(self.config.max_backoff)
    }

    /// Returns `true` if any retries remain after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.config.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_retries: u32, max_backoff: Duration) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(100),
            max_backoff,
            multiplier: 2.0,
            jitter_fraction: 0.0,
        })
    }

    #[test]
    fn delays_double() {
        let policy = no_jitter(3, Duration::from_secs(30));
        assert_eq!(policy.next_delay(1).unwrap().as_millis(), 100);
        assert_eq!(policy.next_delay(2).unwrap().as_millis(), 200);
        assert_eq!(policy.next_delay(3).unwrap().as_millis(), 400);
        assert!(policy.next_delay(4).is_none());
    }

    #[test]
    fn backoff_settles_at_max() {
        let policy = no_jitter(2, Duration::from_secs(5));
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_secs(5));
        assert_eq!(policy.backoff(50), Duration::from_secs(5));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 10.0,
            jitter_fraction: 0.5,
        });
        let d5 = policy.next_delay(5).unwrap();
        assert!(d5 <= Duration::from_millis(500), "d5={d5:?} exceeds max");
    }

    #[test]
    fn jitter_spreads_delays() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_fraction: 0.5,
        });
        let delays: std::collections::HashSet<u128> =
            (0..64).map(|_| policy.next_delay(1).unwrap().as_millis()).collect();
        assert!(delays.len() > 1, "every delay was {delays:?}");
        assert!(delays.iter().all(|d| (750..=1250).contains(d)), "{delays:?}");
    }

    #[test]
    fn should_retry_boundary() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 2,
            ..Default::default()
        });
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}

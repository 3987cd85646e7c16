//! Retry backoff policy

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with a cap and optional jitter
///
/// The delay before dispatching attempt `n + 1` after attempt `n` failed is
/// `min(max, base * 2^n)`, optionally spread by the jitter factor to avoid
/// synchronized retries.
///
/// # Example
///
/// ```
/// use metronome_core::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(60));
///
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(8));
/// assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay
    pub base: Duration,

    /// Cap on the computed delay
    pub max: Duration,

    /// Jitter factor (0.0–1.0); 0.1 means up to ±10% randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy without jitter
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Set the jitter factor
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before re-dispatching after `attempt` failed attempts
    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        let exp = attempt.clamp(0, 62) as u32;
        let base = self.base.as_secs_f64() * 2f64.powi(exp as i32);
        let capped = base.min(self.max.as_secs_f64());

        let delayed = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(delayed)
    }
}

//! Engine configuration
//!
//! Settings come from `METRONOME_*` environment variables with defaults that
//! match the documented behavior; a value that fails to parse falls back to
//! its default rather than aborting startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// All recognized settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Seconds between worker heartbeats
    pub worker_heartbeat_interval: u64,

    /// Seconds after which a silent worker is considered dead
    pub worker_heartbeat_timeout: u64,

    /// Fallback polling period when no queue wake-ups arrive (seconds,
    /// fractional allowed for fast polling in tests)
    pub worker_poll_interval: f64,

    /// Per-worker concurrency ceiling
    pub worker_max_concurrent: usize,

    /// Default per-task timeout (seconds)
    pub default_timeout: u64,

    /// Default per-workflow lifetime timeout (seconds)
    pub default_workflow_timeout: u64,

    /// Default `max_retries` for new executions
    pub default_retries: i32,

    /// Exponential backoff base (seconds)
    pub default_retry_backoff_base: f64,

    /// Exponential backoff cap (seconds)
    pub default_retry_backoff_max: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/metronome".to_string(),
            worker_heartbeat_interval: 5,
            worker_heartbeat_timeout: 30,
            worker_poll_interval: 1.0,
            worker_max_concurrent: 10,
            default_timeout: 300,
            default_workflow_timeout: 3600,
            default_retries: 3,
            default_retry_backoff_base: 2.0,
            default_retry_backoff_max: 60.0,
        }
    }
}

impl Settings {
    /// Load settings from `METRONOME_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_url: env_var("METRONOME_DATABASE_URL").unwrap_or(defaults.database_url),
            worker_heartbeat_interval: env_parsed(
                "METRONOME_WORKER_HEARTBEAT_INTERVAL",
                defaults.worker_heartbeat_interval,
            ),
            worker_heartbeat_timeout: env_parsed(
                "METRONOME_WORKER_HEARTBEAT_TIMEOUT",
                defaults.worker_heartbeat_timeout,
            ),
            worker_poll_interval: env_parsed(
                "METRONOME_WORKER_POLL_INTERVAL",
                defaults.worker_poll_interval,
            ),
            worker_max_concurrent: env_parsed(
                "METRONOME_WORKER_MAX_CONCURRENT",
                defaults.worker_max_concurrent,
            ),
            default_timeout: env_parsed("METRONOME_DEFAULT_TIMEOUT", defaults.default_timeout),
            default_workflow_timeout: env_parsed(
                "METRONOME_DEFAULT_WORKFLOW_TIMEOUT",
                defaults.default_workflow_timeout,
            ),
            default_retries: env_parsed("METRONOME_DEFAULT_RETRIES", defaults.default_retries),
            default_retry_backoff_base: env_parsed(
                "METRONOME_DEFAULT_RETRY_BACKOFF_BASE",
                defaults.default_retry_backoff_base,
            ),
            default_retry_backoff_max: env_parsed(
                "METRONOME_DEFAULT_RETRY_BACKOFF_MAX",
                defaults.default_retry_backoff_max,
            ),
        }
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.worker_heartbeat_interval)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_heartbeat_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.worker_poll_interval.max(0.001))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout)
    }

    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.default_workflow_timeout)
    }

    /// The retry policy implied by the backoff settings
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs_f64(self.default_retry_backoff_base.max(0.0)),
            Duration::from_secs_f64(self.default_retry_backoff_max.max(0.0)),
        )
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env_var(name).map(|v| v.parse::<T>()) {
        Some(Ok(value)) => value,
        Some(Err(_)) => {
            tracing::warn!(var = name, "unparseable value, using default");
            default
        }
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();

        assert_eq!(settings.worker_heartbeat_interval, 5);
        assert_eq!(settings.worker_heartbeat_timeout, 30);
        assert_eq!(settings.worker_max_concurrent, 10);
        assert_eq!(settings.default_retries, 3);
        assert_eq!(settings.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(settings.workflow_timeout(), Duration::from_secs(3600));
    }

    #[test]
    fn test_retry_policy_from_settings() {
        let settings = Settings::default();
        let policy = settings.retry_policy();

        assert_eq!(policy.base, Duration::from_secs(2));
        assert_eq!(policy.max, Duration::from_secs(60));
    }

    #[test]
    fn test_env_override() {
        // Env vars are process-global; use names no other test touches.
        std::env::set_var("METRONOME_WORKER_MAX_CONCURRENT", "32");
        std::env::set_var("METRONOME_WORKER_POLL_INTERVAL", "0.05");
        std::env::set_var("METRONOME_DEFAULT_RETRIES", "not-a-number");

        let settings = Settings::from_env();
        assert_eq!(settings.worker_max_concurrent, 32);
        assert_eq!(settings.worker_poll_interval, 0.05);
        assert_eq!(settings.default_retries, 3);

        std::env::remove_var("METRONOME_WORKER_MAX_CONCURRENT");
        std::env::remove_var("METRONOME_WORKER_POLL_INTERVAL");
        std::env::remove_var("METRONOME_DEFAULT_RETRIES");
    }
}

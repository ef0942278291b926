//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Upper bound on parallel workers; each one may hold a heavyweight
/// external resource.
pub const MAX_WORKERS: usize = 64;

/// Run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Bounded parallelism N. Fixed for the whole run.
    pub worker_count: usize,
    /// Maximum time to wait for in-flight tasks after a stop request.
    pub max_drain: Duration,
    /// Attempts per task, first attempt included.
    pub retry_limit: u32,
    /// Fixed delay between task attempts.
    pub retry_delay: Duration,
    /// Completion polling cadence while running.
    pub poll_interval_running: Duration,
    /// Completion polling cadence while draining. Must not be coarser than
    /// `poll_interval_running`.
    pub poll_interval_draining: Duration,
    /// Save attempts made by the persistence gate.
    pub save_attempts: u32,
    /// Delay between save attempts.
    pub save_retry_delay: Duration,
    /// Directory results are written into.
    pub output_dir: PathBuf,
    /// File name prefix for result files.
    pub output_prefix: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            max_drain: Duration::from_secs(5),
            retry_limit: 3,
            retry_delay: Duration::from_millis(500),
            poll_interval_running: Duration::from_secs(1),
            poll_interval_draining: Duration::from_millis(200),
            save_attempts: 3,
            save_retry_delay: Duration::from_millis(500),
            output_dir: PathBuf::from("./captures"),
            output_prefix: "captured".to_string(),
        }
    }
}

impl RunConfig {
    /// Build a configuration from `CAPTURE_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_count: env_parse("CAPTURE_WORKERS").unwrap_or(defaults.worker_count),
            max_drain: env_millis("CAPTURE_MAX_DRAIN_MS").unwrap_or(defaults.max_drain),
            retry_limit: env_parse("CAPTURE_RETRY_LIMIT").unwrap_or(defaults.retry_limit),
            retry_delay: env_millis("CAPTURE_RETRY_DELAY_MS").unwrap_or(defaults.retry_delay),
            poll_interval_running: env_millis("CAPTURE_POLL_RUNNING_MS")
                .unwrap_or(defaults.poll_interval_running),
            poll_interval_draining: env_millis("CAPTURE_POLL_DRAINING_MS")
                .unwrap_or(defaults.poll_interval_draining),
            save_attempts: env_parse("CAPTURE_SAVE_ATTEMPTS").unwrap_or(defaults.save_attempts),
            save_retry_delay: env_millis("CAPTURE_SAVE_RETRY_DELAY_MS")
                .unwrap_or(defaults.save_retry_delay),
            output_dir: std::env::var("CAPTURE_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            output_prefix: std::env::var("CAPTURE_OUTPUT_PREFIX")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.output_prefix),
        }
    }

    /// Reject configurations the run cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 || self.worker_count > MAX_WORKERS {
            return Err(ConfigError::invalid(
                "worker_count",
                format!("must be between 1 and {MAX_WORKERS}, got {}", self.worker_count),
            ));
        }
        if self.retry_limit == 0 {
            return Err(ConfigError::invalid("retry_limit", "must be at least 1"));
        }
        if self.save_attempts == 0 {
            return Err(ConfigError::invalid("save_attempts", "must be at least 1"));
        }
        if self.poll_interval_running.is_zero() || self.poll_interval_draining.is_zero() {
            return Err(ConfigError::invalid(
                "poll_interval",
                "polling intervals must be non-zero",
            ));
        }
        if self.poll_interval_draining > self.poll_interval_running {
            return Err(ConfigError::invalid(
                "poll_interval_draining",
                format!(
                    "{:?} is coarser than the running interval {:?}",
                    self.poll_interval_draining, self.poll_interval_running
                ),
            ));
        }
        if self.output_prefix.contains(['/', '\\']) {
            return Err(ConfigError::invalid(
                "output_prefix",
                "must be a bare file name prefix",
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

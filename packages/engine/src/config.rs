use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::kernel::jobs::{DispatcherConfig, RetryPolicy, WatchdogConfig};

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub openai_api_key: Option<String>,
    pub embedding_model: String,
    pub worker_concurrency: usize,
    pub max_in_flight: usize,
    pub poll_interval_ms: u64,
    pub job_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub stale_job_timeout_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub job_retention_hours: u64,
    pub default_max_retries: i32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let config = Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            embedding_model: env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            worker_concurrency: parse_var("WORKER_CONCURRENCY", 2)?,
            max_in_flight: parse_var("MAX_IN_FLIGHT", 4)?,
            poll_interval_ms: parse_var("POLL_INTERVAL_MS", 1_000)?,
            job_timeout_ms: parse_var("JOB_TIMEOUT_MS", 300_000)?,
            heartbeat_interval_ms: parse_var("HEARTBEAT_INTERVAL_MS", 30_000)?,
            stale_job_timeout_ms: parse_var("STALE_JOB_TIMEOUT_MS", 600_000)?,
            retry_base_delay_ms: parse_var("RETRY_BASE_DELAY_MS", 1_000)?,
            retry_max_delay_ms: parse_var("RETRY_MAX_DELAY_MS", 300_000)?,
            job_retention_hours: parse_var("JOB_RETENTION_HOURS", 168)?,
            default_max_retries: parse_var("DEFAULT_MAX_RETRIES", 3)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings under which the watchdog would recover live jobs.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            bail!("HEARTBEAT_INTERVAL_MS must be greater than zero");
        }
        // A missed beat or two must not look like a dead worker.
        if self.heartbeat_interval_ms.saturating_mul(2) > self.stale_job_timeout_ms {
            bail!(
                "HEARTBEAT_INTERVAL_MS ({}) must be at most half of STALE_JOB_TIMEOUT_MS ({})",
                self.heartbeat_interval_ms,
                self.stale_job_timeout_ms
            );
        }
        if self.worker_concurrency == 0 || self.max_in_flight == 0 {
            bail!("WORKER_CONCURRENCY and MAX_IN_FLIGHT must be greater than zero");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            job_timeout: Duration::from_millis(self.job_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            max_in_flight: self.max_in_flight,
            ..Default::default()
        }
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            stale_after: Duration::from_millis(self.stale_job_timeout_ms),
            retention: Duration::from_secs(self.job_retention_hours * 3600),
            ..Default::default()
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .ok()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

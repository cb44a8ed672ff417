//! Worker configuration from environment variables

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::str::FromStr;
use std::time::Duration;

use portal_processes::{EngineConfig, PollerConfig};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Everything the worker binary needs to start
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique identifier for this worker instance
    pub worker_id: String,
    pub database_url: String,
    pub database_max_connections: u32,
    /// Processes discovered per pass
    pub batch_size: usize,
    pub max_concurrent_processes: usize,
    pub lock_expiry: Duration,
    pub poll_min_interval: Duration,
    pub poll_max_interval: Duration,
    /// Execute a single pass and exit
    pub run_once: bool,
    pub wallet_service_url: String,
    pub did_validation_url: String,
    pub mail_service_url: String,
    pub http_timeout: Duration,
}

impl WorkerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create configuration from a fixed set of variables
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|name| vars.get(name).cloned())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let engine = EngineConfig::default();
        let poller = PollerConfig::default();

        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let worker_id = lookup("WORKER_ID").unwrap_or_else(|| format!("worker-{}", Uuid::now_v7()));

        Ok(Self {
            worker_id,
            database_url,
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            batch_size: parse_or(&lookup, "PROCESS_BATCH_SIZE", engine.batch_size)?,
            max_concurrent_processes: parse_or(
                &lookup,
                "MAX_CONCURRENT_PROCESSES",
                engine.max_concurrent_processes,
            )?,
            // A zero expiry would hand out locks that are already expired
            lock_expiry: Duration::from_secs(
                parse_or(
                    &lookup,
                    "LOCK_EXPIRY_SECONDS",
                    NonZeroU64::new(engine.lock_expiry.as_secs()).unwrap_or(NonZeroU64::MIN),
                )?
                .get(),
            ),
            poll_min_interval: Duration::from_millis(parse_or(
                &lookup,
                "POLL_MIN_INTERVAL_MS",
                poller.min_interval.as_millis() as u64,
            )?),
            poll_max_interval: Duration::from_millis(parse_or(
                &lookup,
                "POLL_MAX_INTERVAL_MS",
                poller.max_interval.as_millis() as u64,
            )?),
            run_once: parse_or(&lookup, "WORKER_RUN_ONCE", false)?,
            wallet_service_url: lookup("WALLET_SERVICE_URL")
                .unwrap_or_else(|| "http://localhost:8081".to_string()),
            did_validation_url: lookup("DID_VALIDATION_URL")
                .unwrap_or_else(|| "http://localhost:8082".to_string()),
            mail_service_url: lookup("MAIL_SERVICE_URL")
                .unwrap_or_else(|| "http://localhost:8083".to_string()),
            http_timeout: Duration::from_secs(parse_or(&lookup, "HTTP_TIMEOUT_SECONDS", 30)?),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::new()
            .with_batch_size(self.batch_size)
            .with_max_concurrent_processes(self.max_concurrent_processes)
            .with_lock_expiry(self.lock_expiry)
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig::new()
            .with_min_interval(self.poll_min_interval)
            .with_max_interval(self.poll_max_interval.max(self.poll_min_interval))
    }
}

/// Parse an optional variable, falling back to `default` when unset
fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

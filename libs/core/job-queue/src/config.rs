//! Worker timing configuration and environment-driven queue settings.

use crate::retry::RetryTiers;
use core_config::{
    ConfigError, FromEnv, env_duration_secs, env_or_default, env_parse_or, env_required,
};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Timing knobs for a consumer worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long one reserve call waits for a job before looping
    pub reserve_timeout: Duration,

    /// Sleep after a failed connect while failures are few
    pub connect_retry_delay: Duration,

    /// Sleep after a failed connect once more than 10 failed in a row
    pub connect_cooldown: Duration,

    /// Sleep after a handler panic before the job is treated as failed
    pub panic_cooldown: Duration,

    /// Sleep after a dispatch error (handler timeout, broker error)
    pub dispatch_error_cooldown: Duration,

    /// Retry schedule for failed jobs
    pub retry_tiers: RetryTiers,
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self {
            reserve_timeout: Duration::from_secs(5),
            connect_retry_delay: Duration::from_secs(1),
            connect_cooldown: Duration::from_secs(10),
            panic_cooldown: Duration::from_secs(10),
            dispatch_error_cooldown: Duration::from_secs(10),
            retry_tiers: RetryTiers::standard(),
        }
    }

    pub fn with_reserve_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = timeout;
        self
    }

    pub fn with_connect_retry_delay(mut self, delay: Duration) -> Self {
        self.connect_retry_delay = delay;
        self
    }

    pub fn with_connect_cooldown(mut self, cooldown: Duration) -> Self {
        self.connect_cooldown = cooldown;
        self
    }

    pub fn with_panic_cooldown(mut self, cooldown: Duration) -> Self {
        self.panic_cooldown = cooldown;
        self
    }

    pub fn with_dispatch_error_cooldown(mut self, cooldown: Duration) -> Self {
        self.dispatch_error_cooldown = cooldown;
        self
    }

    pub fn with_retry_tiers(mut self, tiers: RetryTiers) -> Self {
        self.retry_tiers = tiers;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Broker backend selected at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Work queue over Redis lists and sorted sets
    Redis,
    /// JetStream pull consumer
    Nats,
    /// In-process broker (tests and local demos)
    Memory,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Redis => "redis",
            Backend::Nats => "nats",
            Backend::Memory => "memory",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Backend::Redis),
            "nats" | "jetstream" => Ok(Backend::Nats),
            "memory" | "mem" => Ok(Backend::Memory),
            other => Err(format!(
                "unknown queue backend '{other}' (expected redis, nats or memory)"
            )),
        }
    }
}

/// Queue client settings loaded from `QUEUE_*` environment variables
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub backend: Backend,
    pub address: String,
    pub queue: String,
    pub pool_size: usize,
    pub workers: usize,
    pub handler_timeout: Duration,
    pub reserve_timeout: Duration,
}

impl QueueSettings {
    /// Worker config seeded with this reserve timeout.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new().with_reserve_timeout(self.reserve_timeout)
    }

    /// Registry key for clients built from these settings.
    pub fn registry_key(&self) -> String {
        format!("{}/{}", self.address, self.queue)
    }
}

impl FromEnv for QueueSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let backend = env_or_default("QUEUE_BACKEND", "redis")
            .parse()
            .map_err(|details| ConfigError::InvalidValue {
                key: "QUEUE_BACKEND".to_string(),
                details,
            })?;

        let address = env_required("QUEUE_ADDRESS")?;
        let queue = env_required("QUEUE_NAME")?;
        if queue.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "QUEUE_NAME".to_string(),
                details: "queue name must not be empty".to_string(),
            });
        }

        let pool_size: usize = env_parse_or("QUEUE_POOL_SIZE", 10)?;
        if pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "QUEUE_POOL_SIZE".to_string(),
                details: "pool size must be at least 1".to_string(),
            });
        }

        let workers: usize = env_parse_or("QUEUE_WORKERS", 1)?;

        Ok(Self {
            backend,
            address,
            queue,
            pool_size,
            workers,
            handler_timeout: env_duration_secs(
                "QUEUE_HANDLER_TIMEOUT_SECS",
                Duration::from_secs(600),
            )?,
            reserve_timeout: env_duration_secs(
                "QUEUE_RESERVE_TIMEOUT_SECS",
                Duration::from_secs(5),
            )?,
        })
    }
}

//! Pool configuration
//!
//! [`PoolConfig`] is what callers write: every field optional. [`PoolSettings`]
//! is what a pool runs with: every field filled, fixed for the pool's lifetime.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::environment::{self, RuntimeEnvironment};
use crate::sizing;
use crate::{EngineError, Result};

/// Default buffer subtracted from a caller deadline
pub const DEFAULT_TIMEOUT_BUFFER_SECS: u64 = 10;

/// Default base delay for retry backoff
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;

const ENV_PREFIX: &str = "BATCH_ENGINE_";

/// Caller-facing configuration; unset fields are derived from the environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Force an environment class instead of detecting it
    pub environment: Option<RuntimeEnvironment>,

    /// Number of concurrent workers
    pub max_workers: Option<usize>,

    /// Bounded task queue capacity
    pub queue_capacity: Option<usize>,

    /// Items per batch chunk before the deadline is re-checked
    pub batch_chunk_size: Option<usize>,

    /// Seconds subtracted from a caller deadline to get the safe deadline
    pub timeout_buffer_seconds: Option<u64>,

    /// Memory ceiling in MB used to size serverless pools
    pub memory_hint_mb: Option<u64>,

    /// Spawn workers on first submit rather than requiring `start`
    pub lazy_start: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            environment: None,
            max_workers: None,
            queue_capacity: None,
            batch_chunk_size: None,
            timeout_buffer_seconds: None,
            memory_hint_mb: None,
            lazy_start: true,
        }
    }
}

/// Fully resolved pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSettings {
    /// Environment class the pool was sized for
    pub environment: RuntimeEnvironment,
    /// Number of concurrent workers
    pub max_workers: usize,
    /// Bounded task queue capacity
    pub queue_capacity: usize,
    /// Items per batch chunk
    pub batch_chunk_size: usize,
    /// Buffer subtracted from caller deadlines
    pub timeout_buffer: Duration,
    /// Memory hint used for sizing (0 when unknown)
    pub memory_hint_mb: u64,
    /// Spawn workers on first submit
    pub lazy_start: bool,
}

impl PoolConfig {
    /// Configuration pinned to an environment class
    pub fn for_environment(environment: RuntimeEnvironment) -> Self {
        Self {
            environment: Some(environment),
            ..Self::default()
        }
    }

    /// Load overrides from `BATCH_ENGINE_*` variables of the current process.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load overrides through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty());

        let environment = read("ENVIRONMENT")
            .map(|v| v.parse::<RuntimeEnvironment>().map_err(EngineError::Config))
            .transpose()?;

        Ok(Self {
            environment,
            max_workers: parse_field(&read, "MAX_WORKERS")?,
            queue_capacity: parse_field(&read, "QUEUE_CAPACITY")?,
            batch_chunk_size: parse_field(&read, "CHUNK_SIZE")?,
            timeout_buffer_seconds: parse_field(&read, "TIMEOUT_BUFFER_SECS")?,
            memory_hint_mb: parse_field(&read, "MEMORY_MB")?,
            lazy_start: read("LAZY_START")
                .map(|v| !matches!(v.trim(), "0" | "false" | "no"))
                .unwrap_or(true),
        })
    }

    /// Fill every unset (or zero) field using the environment profiler and sizing policy.
    pub fn resolve(&self) -> PoolSettings {
        let detected = environment::profile();
        let environment = self.environment.unwrap_or(detected.environment);
        let memory_hint_mb = non_zero(self.memory_hint_mb)
            .or(detected.memory_hint_mb)
            .unwrap_or(0);
        self.resolve_with(environment, memory_hint_mb, num_cpus::get())
    }

    /// Deterministic resolution against a known host.
    pub fn resolve_with(&self, environment: RuntimeEnvironment, memory_hint_mb: u64, cpu_cores: usize) -> PoolSettings {
        let environment = self.environment.unwrap_or(environment);
        let memory_hint_mb = non_zero(self.memory_hint_mb).unwrap_or(memory_hint_mb);

        let settings = PoolSettings {
            environment,
            max_workers: non_zero(self.max_workers)
                .unwrap_or_else(|| sizing::worker_count_for(environment, memory_hint_mb, cpu_cores)),
            queue_capacity: non_zero(self.queue_capacity)
                .unwrap_or_else(|| sizing::optimal_queue_capacity(environment)),
            batch_chunk_size: non_zero(self.batch_chunk_size)
                .unwrap_or_else(|| sizing::optimal_batch_chunk_size(environment)),
            timeout_buffer: Duration::from_secs(
                non_zero(self.timeout_buffer_seconds).unwrap_or(DEFAULT_TIMEOUT_BUFFER_SECS),
            ),
            memory_hint_mb,
            lazy_start: self.lazy_start,
        };

        debug!(
            environment = %settings.environment,
            max_workers = settings.max_workers,
            queue_capacity = settings.queue_capacity,
            batch_chunk_size = settings.batch_chunk_size,
            "Resolved pool settings"
        );

        settings
    }
}

fn non_zero<T: Default + PartialEq>(value: Option<T>) -> Option<T> {
    value.filter(|v| *v != T::default())
}

fn parse_field<T, F>(read: &F, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    read(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| EngineError::Config(format!("{ENV_PREFIX}{name}={raw}: {e}")))
        })
        .transpose()
}

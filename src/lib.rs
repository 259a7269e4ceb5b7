//! # Adaptive Batch Engine
//!
//! An environment-aware worker pool and deadline-bounded batch processor.
//!
//! ## Overview
//!
//! The engine runs bulk units of work under resource constraints that depend on
//! where the process is hosted: a function-as-a-service host with a hard
//! wall-clock deadline, a long-running container, or a local developer machine.
//! Pool sizing, queue behaviour and batch chunking all adapt to that host.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use batch_engine::batch::{BatchConfig, BatchProcessor};
//! use batch_engine::config::PoolConfig;
//! use batch_engine::pool::WorkerPool;
//!
//! # async fn example() -> batch_engine::Result<()> {
//! let pool = Arc::new(WorkerPool::new(PoolConfig::default()));
//! let processor = BatchProcessor::new(pool.clone(), BatchConfig::default());
//!
//! let ids: Vec<String> = (0..100).map(|i| format!("record-{i}")).collect();
//! let result = processor
//!     .process_batch(ids, |_cancel, id: String| async move {
//!         tracing::debug!(%id, "persisting");
//!         Ok(())
//!     }, None)
//!     .await?;
//!
//! assert_eq!(result.success_count, 100);
//! pool.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`environment`]: Host classification from process environment signals
//! - [`sizing`]: Worker count, queue capacity and chunk size policy
//! - [`config`]: Pool configuration and resolution
//! - [`pool`]: Bounded-queue worker pool with supervised workers
//! - [`batch`]: Deadline-aware batch processing with retry
//! - [`collector`]: Thread-safe per-item error accumulation
//! - [`metrics`]: Prometheus metrics bound to a caller-owned registry
//! - [`telemetry`]: Tracing subscriber setup

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Worker pool lifecycle or capacity error
    #[error("Pool error: {0}")]
    Pool(#[from] pool::PoolError),

    /// Batch-level failure (timeout, cancellation)
    #[error("Batch error: {0}")]
    Batch(#[from] batch::BatchError),

    /// Errors aggregated by an error collector
    #[error("Collected errors: {0}")]
    Collected(#[from] collector::CollectedError),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registration failure
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Runtime environment classification
pub mod environment;

/// Pool sizing policy
pub mod sizing;

/// Pool configuration
pub mod config;

/// Worker pool
pub mod pool;

/// Batch processing
pub mod batch;

/// Error collection
pub mod collector;

/// Metrics
pub mod metrics;

/// Tracing setup
pub mod telemetry;

pub use batch::{BatchConfig, BatchItem, BatchProcessor, BatchResult};
pub use collector::ErrorCollector;
pub use config::{PoolConfig, PoolSettings};
pub use environment::RuntimeEnvironment;
pub use pool::{PoolStats, Task, WorkerPool};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_converts() {
        let err: EngineError = pool::PoolError::AlreadyRunning.into();
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn test_config_error_message() {
        let err = EngineError::Config("bad worker count".to_string());
        assert_eq!(err.to_string(), "Configuration error: bad worker count");
    }
}

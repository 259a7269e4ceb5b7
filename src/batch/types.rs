use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::collector::{SharedError, DEFAULT_MAX_ENTRIES};
use crate::config::DEFAULT_RETRY_BASE_DELAY_MS;
use crate::pool::PoolError;

/// Anything with a stable string identifier can be batched.
///
/// The engine never looks past the id.
pub trait BatchItem: Send + 'static {
    /// Stable identifier used for error reporting and retries
    fn item_id(&self) -> String;
}

impl BatchItem for String {
    fn item_id(&self) -> String {
        self.clone()
    }
}

impl BatchItem for u64 {
    fn item_id(&self) -> String {
        self.to_string()
    }
}

/// Result of one batch invocation
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Identifier used in logs for this invocation
    pub batch_id: Uuid,
    /// Items whose processing function returned `Ok`
    pub success_count: usize,
    /// Items that failed, were rejected, skipped, or (after a timeout) never finished
    pub failed_count: usize,
    /// Items supplied by the caller
    pub total_count: usize,
    /// Per-item errors, capped by the batch's error collector
    pub errors: HashMap<String, SharedError>,
    /// Wall-clock duration
    pub duration: Duration,
    /// Start timestamp
    pub started_at: DateTime<Utc>,
    /// Passes made over the items (greater than 1 only with retries)
    pub attempts: u32,
}

impl BatchResult {
    pub(crate) fn empty(batch_id: Uuid, total_count: usize, started_at: DateTime<Utc>) -> Self {
        Self {
            batch_id,
            success_count: 0,
            failed_count: 0,
            total_count,
            errors: HashMap::new(),
            duration: Duration::ZERO,
            started_at,
            attempts: 1,
        }
    }

    /// Every item succeeded
    pub fn is_complete_success(&self) -> bool {
        self.success_count == self.total_count && self.failed_count == 0
    }

    /// Items neither counted as succeeded nor failed.
    ///
    /// Non-zero when a task panicked: the pool contains the fault but never
    /// runs that task's completion callback.
    pub fn unaccounted(&self) -> usize {
        self.total_count
            .saturating_sub(self.success_count)
            .saturating_sub(self.failed_count)
    }

    /// Percentage of items that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.total_count == 0 {
            return 100.0;
        }
        (self.success_count as f64 / self.total_count as f64) * 100.0
    }
}

/// Batch-level failures; each carries whatever progress was made
#[derive(Error, Debug)]
pub enum BatchError {
    /// The safe deadline passed before or during the batch
    #[error(
        "batch timeout: {} of {} items succeeded before the deadline",
        .result.success_count,
        .result.total_count
    )]
    Timeout {
        /// Partial result
        result: Box<BatchResult>,
    },

    /// The pool was stopped while the batch was running
    #[error(
        "batch cancelled: {} of {} items succeeded before shutdown",
        .result.success_count,
        .result.total_count
    )]
    Cancelled {
        /// Partial result
        result: Box<BatchResult>,
    },
}

impl BatchError {
    /// Partial result carried by the error
    pub fn partial_result(&self) -> &BatchResult {
        match self {
            BatchError::Timeout { result } | BatchError::Cancelled { result } => result,
        }
    }

    /// Take ownership of the partial result
    pub fn into_partial_result(self) -> BatchResult {
        match self {
            BatchError::Timeout { result } | BatchError::Cancelled { result } => *result,
        }
    }
}

/// Per-item error recorded for items the batch never got to
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ItemError {
    /// Not scheduled because too little time remained
    #[error("skipped: insufficient time before deadline")]
    Skipped,

    /// The pool refused the submission
    #[error("submission rejected: {0}")]
    Rejected(#[from] PoolError),
}

/// Batch processor configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Override the pool's timeout buffer
    pub timeout_buffer: Option<Duration>,
    /// Override the pool's chunk size
    pub chunk_size: Option<usize>,
    /// Cap on stored per-item errors
    pub max_error_entries: usize,
    /// Stop storing errors after the first one
    pub stop_on_first_error: bool,
    /// First retry delay; doubled per attempt
    pub retry_base_delay: Duration,
    /// Upper bound on any retry delay
    pub retry_max_delay: Duration,
    /// Serverless only: stop scheduling chunks with less than this much time left
    pub min_chunk_window: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            timeout_buffer: None,
            chunk_size: None,
            max_error_entries: DEFAULT_MAX_ENTRIES,
            stop_on_first_error: false,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            retry_max_delay: Duration::from_secs(10),
            min_chunk_window: Duration::from_secs(5),
        }
    }
}

//! Deadline-aware batch processing on top of the worker pool

pub mod deadline;
pub mod executor;
pub mod retry;
pub mod types;

pub use deadline::{chunk_size_for, safe_deadline, DeadlinePlan};
pub use executor::BatchProcessor;
pub use retry::RetryPolicy;
pub use types::{BatchConfig, BatchError, BatchItem, BatchResult, ItemError};

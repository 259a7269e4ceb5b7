//! Batch Processor
//!
//! Runs a list of items through a [`WorkerPool`] in deadline-aware chunks:
//! - Safe deadline = caller deadline minus a buffer; fail fast if already past
//! - Chunk size shrinks as the safe deadline approaches
//! - Each chunk drains before the next one is sized and scheduled
//! - A firing deadline yields a partial result instead of discarding progress
//! - Optional retry of failed items with exponential backoff

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::batch::deadline::DeadlinePlan;
use crate::batch::retry::RetryPolicy;
use crate::batch::types::{BatchConfig, BatchError, BatchItem, BatchResult, ItemError};
use crate::collector::ErrorCollector;
use crate::metrics::EngineMetrics;
use crate::pool::{Task, WorkerPool};

/// Batch processor bound to one worker pool
pub struct BatchProcessor {
    pool: Arc<WorkerPool>,
    config: BatchConfig,
    metrics: Option<Arc<EngineMetrics>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    Timeout,
    Cancelled,
}

/// Outcome of one pass over a set of items
struct BatchRun {
    result: BatchResult,
    failed_ids: Vec<String>,
    interruption: Option<Interruption>,
}

impl BatchRun {
    fn into_result(self) -> Result<BatchResult, BatchError> {
        match self.interruption {
            None => Ok(self.result),
            Some(Interruption::Timeout) => Err(BatchError::Timeout {
                result: Box::new(self.result),
            }),
            Some(Interruption::Cancelled) => Err(BatchError::Cancelled {
                result: Box::new(self.result),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    failed_ids: Vec<String>,
}

/// Counters and errors for one pass, updated from completion callbacks
struct BatchState {
    tally: Mutex<Tally>,
    errors: ErrorCollector,
}

impl BatchState {
    fn new(config: &BatchConfig) -> Self {
        Self {
            tally: Mutex::new(Tally::default()),
            errors: ErrorCollector::new(config.max_error_entries)
                .stop_on_first_error(config.stop_on_first_error),
        }
    }

    fn record(&self, id: &str, outcome: anyhow::Result<()>) {
        let mut tally = self.tally.lock();
        match outcome {
            Ok(()) => tally.succeeded += 1,
            Err(err) => {
                tally.failed += 1;
                tally.failed_ids.push(id.to_string());
                self.errors.add(id, err);
            }
        }
    }

    fn snapshot(&self) -> (usize, usize, Vec<String>) {
        let tally = self.tally.lock();
        (tally.succeeded, tally.failed, tally.failed_ids.clone())
    }
}

/// Outstanding tasks of the current chunk
#[derive(Default)]
struct Outstanding {
    count: AtomicUsize,
    idle: Notify,
}

impl Outstanding {
    fn ticket(self: &Arc<Self>) -> Ticket {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ticket(self.clone())
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held by a task until its outcome is recorded or the task is dropped
struct Ticket(Arc<Outstanding>);

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl BatchProcessor {
    /// Create a processor; metrics are inherited from the pool
    pub fn new(pool: Arc<WorkerPool>, config: BatchConfig) -> Self {
        let metrics = pool.metrics().cloned();
        Self {
            pool,
            config,
            metrics,
        }
    }

    /// The underlying pool
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Processor configuration
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Process every item once.
    ///
    /// Per-item failures never abort siblings; they are counted and recorded in
    /// [`BatchResult::errors`]. A deadline or pool shutdown returns a
    /// [`BatchError`] carrying the partial result.
    #[instrument(skip_all, fields(items = items.len(), environment = %self.pool.environment()))]
    pub async fn process_batch<I, F, Fut>(
        &self,
        items: Vec<I>,
        process_fn: F,
        deadline: Option<Instant>,
    ) -> Result<BatchResult, BatchError>
    where
        I: BatchItem,
        F: Fn(CancellationToken, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let run = self.run_batch(items, Arc::new(process_fn), deadline).await;
        self.record_metrics(&run.result);
        run.into_result()
    }

    /// Process items, re-running only the failed ones up to `max_attempts` passes.
    ///
    /// Retries are disabled on constrained serverless hosts.
    #[instrument(skip_all, fields(items = items.len(), max_attempts = max_attempts))]
    pub async fn process_batch_with_retry<I, F, Fut>(
        &self,
        items: Vec<I>,
        process_fn: F,
        max_attempts: u32,
    ) -> Result<BatchResult, BatchError>
    where
        I: BatchItem + Clone,
        F: Fn(CancellationToken, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let policy = RetryPolicy::for_environment(
            self.pool.environment(),
            max_attempts,
            self.config.retry_base_delay,
            self.config.retry_max_delay,
        );
        if policy.max_attempts < max_attempts {
            info!(
                requested = max_attempts,
                "Retries disabled in constrained serverless environment"
            );
        }

        let started = Instant::now();
        let total = items.len();
        let process_fn = Arc::new(process_fn);
        let originals: HashMap<String, I> = items
            .iter()
            .map(|item| (item.item_id(), item.clone()))
            .collect();

        let mut remaining = items;
        let mut succeeded = 0usize;
        let mut attempt = 1u32;

        let mut run = loop {
            let run = self.run_batch(remaining, process_fn.clone(), None).await;
            succeeded += run.result.success_count;

            if run.interruption.is_some() || run.failed_ids.is_empty() || attempt >= policy.max_attempts {
                break run;
            }

            let delay = policy.delay_after(attempt);
            warn!(
                attempt = attempt,
                failed = run.failed_ids.len(),
                delay_ms = delay.as_millis() as u64,
                "Retrying failed batch items"
            );
            tokio::time::sleep(delay).await;

            remaining = run
                .failed_ids
                .iter()
                .filter_map(|id| originals.get(id).cloned())
                .collect();
            attempt += 1;
        };

        run.result.success_count = succeeded;
        run.result.total_count = total;
        run.result.attempts = attempt;
        run.result.duration = started.elapsed();

        info!(
            attempts = attempt,
            succeeded = succeeded,
            failed = run.result.failed_count,
            total = total,
            "Batch with retry finished"
        );

        self.record_metrics(&run.result);
        run.into_result()
    }

    async fn run_batch<I, F, Fut>(&self, items: Vec<I>, process_fn: Arc<F>, deadline: Option<Instant>) -> BatchRun
    where
        I: BatchItem,
        F: Fn(CancellationToken, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let started = Instant::now();
        let batch_id = Uuid::new_v4();
        let total = items.len();
        let mut result = BatchResult::empty(batch_id, total, Utc::now());

        let settings = self.pool.settings();
        let environment = settings.environment;
        let buffer = self.config.timeout_buffer.unwrap_or(settings.timeout_buffer);
        let base_chunk = self.config.chunk_size.unwrap_or(settings.batch_chunk_size);
        let plan = DeadlinePlan::new(deadline, buffer);

        if total == 0 {
            debug!(batch_id = %batch_id, "No items to process");
            return BatchRun {
                result,
                failed_ids: Vec::new(),
                interruption: None,
            };
        }

        if plan.expired() {
            warn!(
                batch_id = %batch_id,
                buffer_ms = buffer.as_millis() as u64,
                "Safe deadline already passed, refusing batch"
            );
            result.failed_count = total;
            return BatchRun {
                result,
                failed_ids: Vec::new(),
                interruption: Some(Interruption::Timeout),
            };
        }

        info!(
            batch_id = %batch_id,
            total_items = total,
            base_chunk_size = base_chunk,
            remaining_ms = ?plan.remaining().map(|r| r.as_millis() as u64),
            "Starting batch"
        );

        let state = Arc::new(BatchState::new(&self.config));
        let outstanding = Arc::new(Outstanding::default());
        let cancel = self.pool.cancellation_token().child_token();

        let mut pending = items.into_iter().peekable();
        let mut chunk_index = 0usize;
        let mut interruption = None;

        while pending.peek().is_some() {
            if plan.expired() {
                interruption = Some(Interruption::Timeout);
                break;
            }
            if chunk_index > 0 && environment.is_constrained() {
                if let Some(remaining) = plan.remaining() {
                    if remaining < self.config.min_chunk_window {
                        info!(
                            batch_id = %batch_id,
                            remaining_ms = remaining.as_millis() as u64,
                            "Too little time left, no further chunks scheduled"
                        );
                        interruption = Some(Interruption::Timeout);
                        break;
                    }
                }
            }
            if cancel.is_cancelled() {
                interruption = Some(Interruption::Cancelled);
                break;
            }

            let size = plan.chunk_size(base_chunk);
            debug!(batch_id = %batch_id, chunk = chunk_index, size = size, "Scheduling chunk");

            for item in pending.by_ref().take(size) {
                let id = item.item_id();
                let ticket = outstanding.ticket();
                let process_fn = process_fn.clone();
                let item_cancel = cancel.clone();
                let recorder = state.clone();

                // The ticket lives in the callback: released once the outcome is
                // recorded, or when a faulted task is torn down without one
                let task = Task::new(id.clone(), move |_worker_cancel| async move {
                    (*process_fn)(item_cancel, item).await
                })
                .with_on_complete(move |id, outcome| {
                    recorder.record(id, outcome);
                    drop(ticket);
                });

                // A full queue blocks submit on non-serverless hosts
                let submitted = tokio::select! {
                    biased;
                    submitted = self.pool.submit(task) => Some(submitted),
                    _ = plan.expiry() => None,
                };
                match submitted {
                    Some(Ok(())) => {}
                    Some(Err(err)) => state.record(&id, Err(ItemError::Rejected(err).into())),
                    None => {
                        warn!(batch_id = %batch_id, item_id = %id, "Safe deadline reached while waiting for queue space");
                        state.record(&id, Err(ItemError::Skipped.into()));
                        interruption = Some(Interruption::Timeout);
                        break;
                    }
                }
            }
            if interruption.is_some() {
                break;
            }

            tokio::select! {
                _ = outstanding.wait_idle() => {}
                _ = plan.expiry() => {
                    warn!(batch_id = %batch_id, chunk = chunk_index, "Safe deadline reached while chunk in flight");
                    interruption = Some(Interruption::Timeout);
                }
            }

            if interruption.is_some() {
                break;
            }
            chunk_index += 1;
        }

        if interruption == Some(Interruption::Timeout) {
            cancel.cancel();
        }

        let skipped: Vec<String> = pending.map(|item| item.item_id()).collect();
        if !skipped.is_empty() {
            debug!(batch_id = %batch_id, skipped = skipped.len(), "Items never scheduled");
        }
        for id in &skipped {
            state.record(id, Err(ItemError::Skipped.into()));
        }

        if interruption.is_none() && cancel.is_cancelled() {
            interruption = Some(Interruption::Cancelled);
        }

        let (succeeded, failed, failed_ids) = state.snapshot();
        result.success_count = succeeded;
        result.failed_count = match interruption {
            // Anything not known to have succeeded counts as failed
            Some(_) => total - succeeded.min(total),
            None => failed,
        };
        result.errors = state.errors.errors();
        result.duration = started.elapsed();

        let batch_result = BatchRun {
            result,
            failed_ids,
            interruption,
        };
        log_summary(&batch_result);
        batch_result
    }

    fn record_metrics(&self, result: &BatchResult) {
        if let Some(metrics) = &self.metrics {
            metrics.record_batch(result.success_count, result.failed_count, result.duration);
        }
    }
}

fn log_summary(run: &BatchRun) {
    let result = &run.result;
    let success_rate = result.success_rate();

    info!(
        batch_id = %result.batch_id,
        total = result.total_count,
        succeeded = result.success_count,
        failed = result.failed_count,
        unaccounted = result.unaccounted(),
        interrupted = ?run.interruption,
        success_rate = format!("{:.2}%", success_rate),
        duration_ms = result.duration.as_millis() as u64,
        "Batch execution completed"
    );

    if success_rate < 80.0 && result.total_count > 5 {
        warn!(
            batch_id = %result.batch_id,
            success_rate = format!("{:.2}%", success_rate),
            failed = result.failed_count,
            "High failure rate detected in batch execution"
        );
    }
}

impl std::fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish()
    }
}

//! Metrics collection for pools and batches
//!
//! Provides Prometheus-compatible counters and histograms. Collectors are
//! registered into a caller-owned [`Registry`] and handed to pools and
//! processors explicitly, so independent pools (and tests) never share state.

use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::Result;

/// Outcome label for task counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Body returned `Ok`
    Succeeded,
    /// Body returned `Err`
    Failed,
    /// Body panicked
    Faulted,
    /// Still queued when the pool stopped
    Discarded,
}

impl TaskOutcome {
    fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Succeeded => "succeeded",
            TaskOutcome::Failed => "failed",
            TaskOutcome::Faulted => "faulted",
            TaskOutcome::Discarded => "discarded",
        }
    }
}

/// Engine metrics bound to one registry
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    tasks: IntCounterVec,
    worker_restarts: IntCounter,
    queue_rejections: IntCounter,
    batch_items: IntCounterVec,
    batch_duration: Histogram,
}

impl EngineMetrics {
    /// Create and register all collectors in `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let tasks = IntCounterVec::new(
            Opts::new("batch_engine_tasks_total", "Tasks processed by the worker pool"),
            &["outcome"],
        )?;
        let worker_restarts = IntCounter::new(
            "batch_engine_worker_restarts_total",
            "Workers replaced after a task fault",
        )?;
        let queue_rejections = IntCounter::new(
            "batch_engine_queue_rejections_total",
            "Submissions rejected because the queue was full",
        )?;
        let batch_items = IntCounterVec::new(
            Opts::new("batch_engine_batch_items_total", "Batch items by final outcome"),
            &["outcome"],
        )?;
        let batch_duration = Histogram::with_opts(
            HistogramOpts::new("batch_engine_batch_duration_seconds", "Batch wall-clock duration")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )?;

        registry.register(Box::new(tasks.clone()))?;
        registry.register(Box::new(worker_restarts.clone()))?;
        registry.register(Box::new(queue_rejections.clone()))?;
        registry.register(Box::new(batch_items.clone()))?;
        registry.register(Box::new(batch_duration.clone()))?;

        Ok(Self {
            registry: registry.clone(),
            tasks,
            worker_restarts,
            queue_rejections,
            batch_items,
            batch_duration,
        })
    }

    /// Record one task outcome
    pub fn record_task(&self, outcome: TaskOutcome) {
        self.tasks.with_label_values(&[outcome.label()]).inc();
    }

    /// Record a worker replacement
    pub fn record_worker_restart(&self) {
        self.worker_restarts.inc();
    }

    /// Record a fail-fast queue rejection
    pub fn record_queue_rejection(&self) {
        self.queue_rejections.inc();
    }

    /// Record a finished batch
    pub fn record_batch(&self, succeeded: usize, failed: usize, duration: Duration) {
        self.batch_items
            .with_label_values(&["succeeded"])
            .inc_by(succeeded as u64);
        self.batch_items
            .with_label_values(&["failed"])
            .inc_by(failed as u64);
        self.batch_duration.observe(duration.as_secs_f64());
    }

    /// Count recorded for one task outcome
    pub fn task_count(&self, outcome: TaskOutcome) -> u64 {
        self.tasks.with_label_values(&[outcome.label()]).get()
    }

    /// Number of worker replacements
    pub fn worker_restart_count(&self) -> u64 {
        self.worker_restarts.get()
    }

    /// Number of fail-fast rejections
    pub fn queue_rejection_count(&self) -> u64 {
        self.queue_rejections.get()
    }

    /// Export the registry in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("worker_restarts", &self.worker_restarts.get())
            .field("queue_rejections", &self.queue_rejections.get())
            .finish()
    }
}

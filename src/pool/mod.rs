//! Worker pool
//!
//! A fixed set of supervised workers pulling from one bounded FIFO queue.
//!
//! - Submissions fail fast with [`PoolError::QueueFull`] in constrained
//!   serverless hosts and wait for space everywhere else.
//! - [`WorkerPool::stop`] is graceful: workers finish the task they hold,
//!   tasks still queued are discarded with their callback signalled.
//! - A panicking task is contained to its worker, which is replaced.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, PoolSettings};
use crate::environment::RuntimeEnvironment;
use crate::metrics::{EngineMetrics, TaskOutcome};

pub mod task;
pub mod worker;

pub use task::{CompletionFn, Task, TaskFn};
pub use worker::WorkerState;

use worker::SharedReceiver;

/// Pool lifecycle and capacity errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// `start` called on a running pool
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Operation requires a running pool
    #[error("worker pool is not running")]
    NotRunning,

    /// The pool is stopping and no longer accepts work
    #[error("worker pool is shutting down")]
    ShuttingDown,

    /// Constrained host with a full queue
    #[error("task queue full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity
        capacity: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopping,
    Stopped,
}

pub(crate) struct PoolState {
    lifecycle: Lifecycle,
    sender: Option<mpsc::Sender<Task>>,
    receiver: Option<SharedReceiver>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) pending: AtomicUsize,
    pub(crate) active_workers: AtomicUsize,
    pub(crate) busy_workers: AtomicUsize,
    pub(crate) tasks_submitted: AtomicUsize,
    pub(crate) tasks_succeeded: AtomicUsize,
    pub(crate) tasks_failed: AtomicUsize,
    pub(crate) tasks_faulted: AtomicUsize,
    pub(crate) tasks_discarded: AtomicUsize,
    pub(crate) workers_restarted: AtomicUsize,
}

/// State shared between the pool handle and its workers
pub(crate) struct PoolShared {
    pub(crate) settings: PoolSettings,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) counters: PoolCounters,
    pub(crate) idle: Notify,
    /// Signalled when a stop completes
    pub(crate) stopped: Notify,
    pub(crate) metrics: Option<Arc<EngineMetrics>>,
}

impl PoolShared {
    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().lifecycle == Lifecycle::Running
    }

    /// One queued or executing task is done
    pub(crate) fn finish_pending(&self) {
        if self.counters.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Read-only snapshot of pool state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Environment class the pool was sized for
    pub environment: RuntimeEnvironment,
    /// Configured worker count
    pub worker_count: usize,
    /// Workers currently alive (drops briefly while a faulted worker is replaced)
    pub active_workers: usize,
    /// Workers currently executing a task
    pub busy_workers: usize,
    /// Tasks waiting in the queue
    pub queue_length: usize,
    /// Bounded queue size
    pub queue_capacity: usize,
    /// Tasks queued or executing
    pub pending_tasks: usize,
    /// Between a successful start and a completed stop
    pub running: bool,
    /// Tasks accepted into the queue
    pub tasks_submitted: usize,
    /// Task bodies that returned `Ok`
    pub tasks_succeeded: usize,
    /// Task bodies that returned `Err`
    pub tasks_failed: usize,
    /// Tasks whose body panicked
    pub tasks_faulted: usize,
    /// Tasks dropped from the queue by `stop`
    pub tasks_discarded: usize,
    /// Replacement workers started after faults
    pub workers_restarted: usize,
}

/// Bounded-queue worker pool
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Create a pool, resolving unset configuration against the current host
    pub fn new(config: PoolConfig) -> Self {
        Self::from_settings(config.resolve(), None)
    }

    /// Create a pool that reports into `metrics`
    pub fn with_metrics(config: PoolConfig, metrics: Arc<EngineMetrics>) -> Self {
        Self::from_settings(config.resolve(), Some(metrics))
    }

    /// Create a pool from already-resolved settings
    pub fn from_settings(settings: PoolSettings, metrics: Option<Arc<EngineMetrics>>) -> Self {
        info!(
            environment = %settings.environment,
            max_workers = settings.max_workers,
            queue_capacity = settings.queue_capacity,
            lazy_start = settings.lazy_start,
            "Created worker pool"
        );

        Self {
            shared: Arc::new(PoolShared {
                settings,
                state: Mutex::new(PoolState {
                    lifecycle: Lifecycle::Created,
                    sender: None,
                    receiver: None,
                    cancel: CancellationToken::new(),
                    workers: Vec::new(),
                }),
                counters: PoolCounters::default(),
                idle: Notify::new(),
                stopped: Notify::new(),
                metrics,
            }),
        }
    }

    /// Resolved settings this pool runs with
    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    /// Environment class the pool was sized for
    pub fn environment(&self) -> RuntimeEnvironment {
        self.shared.settings.environment
    }

    /// Metrics sink, if one was injected
    pub fn metrics(&self) -> Option<&Arc<EngineMetrics>> {
        self.shared.metrics.as_ref()
    }

    /// Token cancelled when the current generation of workers is stopped
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.state.lock().cancel.clone()
    }

    /// Launch the workers. Must be called inside a Tokio runtime.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();
        match state.lifecycle {
            Lifecycle::Running => Err(PoolError::AlreadyRunning),
            Lifecycle::Stopping => Err(PoolError::ShuttingDown),
            Lifecycle::Created | Lifecycle::Stopped => {
                launch(&self.shared, &mut state);
                Ok(())
            }
        }
    }

    /// Enqueue a task.
    ///
    /// Never drops a task silently: every rejection is returned to the caller.
    pub async fn submit(&self, task: Task) -> Result<(), PoolError> {
        let (sender, cancel) = {
            let mut state = self.shared.state.lock();
            match state.lifecycle {
                Lifecycle::Running => {}
                Lifecycle::Created if self.shared.settings.lazy_start => {
                    launch(&self.shared, &mut state);
                }
                Lifecycle::Created | Lifecycle::Stopped => return Err(PoolError::NotRunning),
                Lifecycle::Stopping => return Err(PoolError::ShuttingDown),
            }
            match &state.sender {
                Some(sender) => (sender.clone(), state.cancel.clone()),
                None => return Err(PoolError::NotRunning),
            }
        };

        let task_id = task.id.clone();
        let slot = PendingSlot::reserve(&self.shared);

        let outcome = if self.shared.settings.environment.is_constrained() {
            sender.try_send(task).map_err(|err| match err {
                TrySendError::Full(_) => PoolError::QueueFull {
                    capacity: self.shared.settings.queue_capacity,
                },
                TrySendError::Closed(_) => PoolError::ShuttingDown,
            })
        } else {
            tokio::select! {
                sent = sender.send(task) => sent.map_err(|_| PoolError::ShuttingDown),
                _ = cancel.cancelled() => Err(PoolError::ShuttingDown),
            }
        };

        match outcome {
            Ok(()) => {
                slot.commit();
                self.shared.counters.tasks_submitted.fetch_add(1, Ordering::SeqCst);
                debug!(task_id = %task_id, "Task queued");
                Ok(())
            }
            Err(err) => {
                drop(slot);
                if matches!(err, PoolError::QueueFull { .. }) {
                    if let Some(metrics) = &self.shared.metrics {
                        metrics.record_queue_rejection();
                    }
                }
                warn!(task_id = %task_id, error = %err, "Task rejected");
                Err(err)
            }
        }
    }

    /// Stop accepting work, cancel workers and wait for them to exit.
    ///
    /// Calling `stop` on a pool that is not running is a no-op. A call made
    /// while another stop is in progress waits for that stop to finish.
    pub async fn stop(&self) {
        let (workers, queue, cancel) = loop {
            let notified = self.shared.stopped.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                match state.lifecycle {
                    Lifecycle::Running => {
                        state.lifecycle = Lifecycle::Stopping;
                        state.sender = None;
                        break (
                            mem::take(&mut state.workers),
                            state.receiver.take(),
                            state.cancel.clone(),
                        );
                    }
                    Lifecycle::Stopping => debug!("Stop already in progress, waiting for it"),
                    Lifecycle::Created | Lifecycle::Stopped => {
                        debug!("Stop requested on a pool that is not running");
                        return;
                    }
                }
            }
            notified.await;
        };

        info!(workers = workers.len(), "Stopping worker pool");
        cancel.cancel();

        let mut supervisor_panic = None;
        for handle in workers {
            if let Err(err) = handle.await {
                if err.is_panic() && supervisor_panic.is_none() {
                    supervisor_panic = Some(err.into_panic());
                }
            }
        }

        let mut discarded = 0usize;
        if let Some(queue) = queue {
            let mut receiver = queue.lock().await;
            receiver.close();
            while let Ok(task) = receiver.try_recv() {
                task.discard(anyhow::Error::new(PoolError::ShuttingDown));
                self.shared.counters.tasks_discarded.fetch_add(1, Ordering::SeqCst);
                if let Some(metrics) = &self.shared.metrics {
                    metrics.record_task(TaskOutcome::Discarded);
                }
                self.shared.finish_pending();
                discarded += 1;
            }
        }

        self.shared.state.lock().lifecycle = Lifecycle::Stopped;
        self.shared.stopped.notify_waiters();
        info!(discarded = discarded, "Worker pool stopped");

        if let Some(payload) = supervisor_panic {
            std::panic::resume_unwind(payload);
        }
    }

    /// Wait until every queued and executing task has finished, without stopping.
    pub async fn wait(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.counters.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Whether the pool is between a successful start and a completed stop
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Snapshot of pool state; safe to call concurrently with every other operation
    pub fn stats(&self) -> PoolStats {
        let (running, queue_length) = {
            let state = self.shared.state.lock();
            let queue_length = state
                .sender
                .as_ref()
                .map(|s| s.max_capacity() - s.capacity())
                .unwrap_or(0);
            (state.lifecycle == Lifecycle::Running, queue_length)
        };
        let counters = &self.shared.counters;

        PoolStats {
            environment: self.shared.settings.environment,
            worker_count: self.shared.settings.max_workers,
            active_workers: counters.active_workers.load(Ordering::SeqCst),
            busy_workers: counters.busy_workers.load(Ordering::SeqCst),
            queue_length,
            queue_capacity: self.shared.settings.queue_capacity,
            pending_tasks: counters.pending.load(Ordering::SeqCst),
            running,
            tasks_submitted: counters.tasks_submitted.load(Ordering::SeqCst),
            tasks_succeeded: counters.tasks_succeeded.load(Ordering::SeqCst),
            tasks_failed: counters.tasks_failed.load(Ordering::SeqCst),
            tasks_faulted: counters.tasks_faulted.load(Ordering::SeqCst),
            tasks_discarded: counters.tasks_discarded.load(Ordering::SeqCst),
            workers_restarted: counters.workers_restarted.load(Ordering::SeqCst),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if state.lifecycle == Lifecycle::Running {
            state.lifecycle = Lifecycle::Stopped;
            state.sender = None;
            state.receiver = None;
            state.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("settings", &self.shared.settings)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Pending-count reservation for a submission; released unless committed,
/// including when the submitting future is dropped mid-send
struct PendingSlot<'a> {
    shared: &'a PoolShared,
    committed: bool,
}

impl<'a> PendingSlot<'a> {
    fn reserve(shared: &'a PoolShared) -> Self {
        shared.counters.pending.fetch_add(1, Ordering::SeqCst);
        Self {
            shared,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.shared.finish_pending();
        }
    }
}

/// Spawn one generation of workers. Called with the state lock held.
fn launch(shared: &Arc<PoolShared>, state: &mut PoolState) {
    let settings = &shared.settings;
    let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
    let queue: SharedReceiver = Arc::new(tokio::sync::Mutex::new(receiver));
    // A fresh pool keeps the token it was created with, so tokens handed out
    // before a lazy start still observe shutdown
    if state.cancel.is_cancelled() {
        state.cancel = CancellationToken::new();
    }
    let cancel = state.cancel.clone();

    state.workers = (0..settings.max_workers.max(1))
        .map(|worker_id| worker::spawn_supervised(shared.clone(), worker_id, queue.clone(), cancel.clone()))
        .collect();
    state.sender = Some(sender);
    state.receiver = Some(queue);
    state.lifecycle = Lifecycle::Running;

    info!(
        environment = %settings.environment,
        workers = state.workers.len(),
        queue_capacity = settings.queue_capacity,
        "Worker pool started"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn local_pool(workers: usize, queue: usize) -> WorkerPool {
        WorkerPool::new(PoolConfig {
            max_workers: Some(workers),
            queue_capacity: Some(queue),
            lazy_start: false,
            ..PoolConfig::for_environment(RuntimeEnvironment::Local)
        })
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let pool = local_pool(2, 4);
        pool.start().unwrap();
        assert_eq!(pool.start(), Err(PoolError::AlreadyRunning));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_submit_without_start_when_not_lazy() {
        let pool = local_pool(2, 4);
        let err = pool.submit(Task::new("t", |_| async { Ok(()) })).await.unwrap_err();
        assert_eq!(err, PoolError::NotRunning);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let pool = local_pool(1, 4);
        pool.start().unwrap();
        pool.stop().await;
        assert!(!pool.is_running());
        pool.start().unwrap();
        assert!(pool.is_running());
        pool.submit(Task::new("after-restart", |_| async { Ok(()) })).await.unwrap();
        pool.wait().await;
        assert_eq!(pool.stats().tasks_succeeded, 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_wait_on_idle_pool_returns() {
        let pool = local_pool(1, 1);
        tokio::time::timeout(Duration::from_millis(100), pool.wait())
            .await
            .expect("wait on an idle pool should return immediately");
    }
}

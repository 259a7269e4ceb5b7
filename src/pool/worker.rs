//! Supervised worker loop
//!
//! Each worker slot is a supervisor task that owns one worker task at a time.
//! A panic inside a task body kills only that worker task; the supervisor logs
//! the fault and starts a replacement while the pool is still running, so the
//! configured concurrency is preserved.

use std::any::Any;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{PoolShared, Task};
use crate::metrics::TaskOutcome;

/// Receiving half of the task queue, shared by every worker of one generation
pub(crate) type SharedReceiver = Arc<Mutex<mpsc::Receiver<Task>>>;

/// Worker state transitions, used for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for a task
    Idle,
    /// Running a task body
    Executing,
    /// Replacing a worker whose task panicked
    Recovering,
    /// Exited after shutdown
    Stopped,
}

pub(crate) fn spawn_supervised(
    shared: Arc<PoolShared>,
    worker_id: usize,
    queue: SharedReceiver,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(supervise(shared, worker_id, queue, cancel))
}

async fn supervise(shared: Arc<PoolShared>, worker_id: usize, queue: SharedReceiver, cancel: CancellationToken) {
    let mut generation: u32 = 0;

    loop {
        let worker = tokio::spawn(run_worker(
            shared.clone(),
            worker_id,
            queue.clone(),
            cancel.clone(),
        ));

        match worker.await {
            Ok(()) => break,
            Err(err) if err.is_panic() => {
                shared.counters.tasks_faulted.fetch_add(1, Ordering::SeqCst);
                if let Some(metrics) = &shared.metrics {
                    metrics.record_task(TaskOutcome::Faulted);
                }

                let reason = panic_message(err.into_panic());
                error!(
                    worker_id = worker_id,
                    generation = generation,
                    state = ?WorkerState::Recovering,
                    reason = %reason,
                    "Worker faulted while executing task"
                );

                if cancel.is_cancelled() || !shared.is_running() {
                    debug!(worker_id = worker_id, "Pool shutting down, not replacing faulted worker");
                    break;
                }

                generation += 1;
                shared.counters.workers_restarted.fetch_add(1, Ordering::SeqCst);
                if let Some(metrics) = &shared.metrics {
                    metrics.record_worker_restart();
                }
                warn!(
                    worker_id = worker_id,
                    generation = generation,
                    "Starting replacement worker"
                );
            }
            Err(err) => {
                warn!(worker_id = worker_id, error = %err, "Worker task cancelled");
                break;
            }
        }
    }
}

async fn run_worker(shared: Arc<PoolShared>, worker_id: usize, queue: SharedReceiver, cancel: CancellationToken) {
    let _alive = LiveWorker::enter(&shared);
    debug!(worker_id = worker_id, state = ?WorkerState::Idle, "Worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            task = async { queue.lock().await.recv().await } => task,
        };

        let Some(task) = next else { break };
        run_task(&shared, worker_id, task, &cancel).await;
    }

    debug!(worker_id = worker_id, state = ?WorkerState::Stopped, "Worker stopped");
}

async fn run_task(shared: &PoolShared, worker_id: usize, task: Task, cancel: &CancellationToken) {
    let Task {
        id,
        execute,
        on_complete,
    } = task;
    let mut in_flight = InFlight::begin(shared, &id);

    debug!(worker_id = worker_id, task_id = %id, state = ?WorkerState::Executing, "Executing task");
    let result = execute(cancel.child_token()).await;
    in_flight.returned = true;

    match &result {
        Ok(()) => {
            shared.counters.tasks_succeeded.fetch_add(1, Ordering::SeqCst);
            if let Some(metrics) = &shared.metrics {
                metrics.record_task(TaskOutcome::Succeeded);
            }
        }
        Err(e) => {
            shared.counters.tasks_failed.fetch_add(1, Ordering::SeqCst);
            if let Some(metrics) = &shared.metrics {
                metrics.record_task(TaskOutcome::Failed);
            }
            debug!(worker_id = worker_id, task_id = %id, error = %e, "Task returned error");
        }
    }

    if let Some(on_complete) = on_complete {
        on_complete(&id, result);
    }
    drop(in_flight);
}

/// Counts a live worker for the lifetime of one worker task
struct LiveWorker<'a> {
    shared: &'a PoolShared,
}

impl<'a> LiveWorker<'a> {
    fn enter(shared: &'a PoolShared) -> Self {
        shared.counters.active_workers.fetch_add(1, Ordering::SeqCst);
        Self { shared }
    }
}

impl Drop for LiveWorker<'_> {
    fn drop(&mut self) {
        self.shared.counters.active_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Marks a task as executing; released on return and when a panicked
/// worker's future is torn down
struct InFlight<'a> {
    shared: &'a PoolShared,
    task_id: &'a str,
    returned: bool,
}

impl<'a> InFlight<'a> {
    fn begin(shared: &'a PoolShared, task_id: &'a str) -> Self {
        shared.counters.busy_workers.fetch_add(1, Ordering::SeqCst);
        Self {
            shared,
            task_id,
            returned: false,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.returned {
            error!(task_id = %self.task_id, "Task did not return; completion callback skipped");
        }
        self.shared.counters.busy_workers.fetch_sub(1, Ordering::SeqCst);
        self.shared.finish_pending();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

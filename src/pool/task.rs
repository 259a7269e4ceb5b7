//! Units of work accepted by the pool

use std::fmt;
use std::future::Future;

use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;

/// Execution body of a task
pub type TaskFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Completion callback, invoked with the task id and the body's outcome
pub type CompletionFn = Box<dyn FnOnce(&str, anyhow::Result<()>) + Send>;

/// A single queued unit of work.
///
/// The completion callback runs after the body returns normally, or with
/// [`PoolError::ShuttingDown`](crate::pool::PoolError::ShuttingDown) if the
/// pool stops before the task is picked up. It does **not** run when the body
/// panics: a faulted task produces no callback, so callers counting callbacks
/// see fewer completions than submissions.
pub struct Task {
    pub(crate) id: String,
    pub(crate) execute: TaskFn,
    pub(crate) on_complete: Option<CompletionFn>,
}

impl Task {
    /// Create a task from an async body
    pub fn new<F, Fut>(id: impl Into<String>, execute: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            execute: Box::new(move |cancel| execute(cancel).boxed()),
            on_complete: None,
        }
    }

    /// Attach a completion callback
    pub fn with_on_complete<C>(mut self, on_complete: C) -> Self
    where
        C: FnOnce(&str, anyhow::Result<()>) + Send + 'static,
    {
        self.on_complete = Some(Box::new(on_complete));
        self
    }

    /// Task identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fire the completion callback without running the body
    pub(crate) fn discard(self, error: anyhow::Error) {
        if let Some(on_complete) = self.on_complete {
            on_complete(&self.id, Err(error));
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("execute", &"FnOnce")
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

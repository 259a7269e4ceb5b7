//! Thread-safe per-item error collection
//!
//! First write wins per id, entries beyond the cap are dropped (but still
//! counted), and a stop-on-first-error collector latches closed after its
//! first stored entry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

/// A per-item error that can be handed out from several places at once
pub type SharedError = Arc<anyhow::Error>;

/// Errors listed individually in a summary message
pub const SUMMARY_PREVIEW: usize = 5;

/// Default cap on stored entries
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Aggregate error returned by [`ErrorCollector::to_error`]
#[derive(Error, Debug, Clone)]
pub enum CollectedError {
    /// Exactly one item failed
    #[error("{id}: {error}")]
    Single {
        /// Failing item id
        id: String,
        /// The item's error
        error: SharedError,
    },

    /// More than one item failed
    #[error("{message}")]
    Multiple {
        /// Total errors reported
        count: usize,
        /// Rendered digest, see [`ErrorSummary::message`]
        message: String,
    },
}

/// Monitoring-friendly digest of a collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorSummary {
    /// Errors reported, including ones dropped by the cap
    pub total_errors: usize,
    /// Stored errors rendered as strings, keyed by item id
    pub errors: BTreeMap<String, String>,
    /// First stored error, rendered
    pub first_error: Option<String>,
    /// Bounded human-readable digest
    pub message: String,
}

#[derive(Debug, Default)]
struct CollectorInner {
    errors_by_id: HashMap<String, SharedError>,
    insertion_order: Vec<String>,
    total_reported: usize,
    stopped: bool,
}

/// Accumulates errors keyed by item id
#[derive(Debug)]
pub struct ErrorCollector {
    inner: Mutex<CollectorInner>,
    max_entries: usize,
    stop_on_first_error: bool,
}

impl ErrorCollector {
    /// Create a collector storing at most `max_entries` errors
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CollectorInner::default()),
            max_entries,
            stop_on_first_error: false,
        }
    }

    /// Latch closed after the first stored error
    pub fn stop_on_first_error(mut self, stop: bool) -> Self {
        self.stop_on_first_error = stop;
        self
    }

    /// Record an error for `id`
    pub fn add(&self, id: impl Into<String>, error: anyhow::Error) {
        self.add_shared(id, Arc::new(error));
    }

    /// Record an already-shared error for `id`
    pub fn add_shared(&self, id: impl Into<String>, error: SharedError) {
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, id.into(), error);
    }

    /// Record many errors under one lock acquisition
    pub fn add_bulk<I, K>(&self, errors: I)
    where
        I: IntoIterator<Item = (K, anyhow::Error)>,
        K: Into<String>,
    {
        let mut inner = self.inner.lock();
        for (id, error) in errors {
            self.insert_locked(&mut inner, id.into(), Arc::new(error));
        }
    }

    fn insert_locked(&self, inner: &mut CollectorInner, id: String, error: SharedError) {
        if inner.stopped || inner.errors_by_id.contains_key(&id) {
            return;
        }
        inner.total_reported += 1;

        if inner.errors_by_id.len() >= self.max_entries {
            return;
        }
        inner.insertion_order.push(id.clone());
        inner.errors_by_id.insert(id, error);

        if self.stop_on_first_error {
            inner.stopped = true;
        }
    }

    /// Whether any error has been reported
    pub fn has_errors(&self) -> bool {
        self.inner.lock().total_reported > 0
    }

    /// Number of errors reported, including ones dropped by the cap
    pub fn total_errors(&self) -> usize {
        self.inner.lock().total_reported
    }

    /// Copy of the stored errors
    pub fn errors(&self) -> HashMap<String, SharedError> {
        self.inner.lock().errors_by_id.clone()
    }

    /// First stored error by insertion order
    pub fn first_error(&self) -> Option<SharedError> {
        let inner = self.inner.lock();
        inner
            .insertion_order
            .first()
            .and_then(|id| inner.errors_by_id.get(id).cloned())
    }

    /// Bounded digest for logs and monitoring
    pub fn summary(&self) -> ErrorSummary {
        let inner = self.inner.lock();
        let errors = inner
            .errors_by_id
            .iter()
            .map(|(id, err)| (id.clone(), err.to_string()))
            .collect();
        let first_error = inner
            .insertion_order
            .first()
            .and_then(|id| inner.errors_by_id.get(id))
            .map(|err| err.to_string());

        ErrorSummary {
            total_errors: inner.total_reported,
            errors,
            first_error,
            message: render_message(&inner),
        }
    }

    /// Empty the collector and reopen a latched one
    pub fn clear(&self) {
        *self.inner.lock() = CollectorInner::default();
    }

    /// Collapse into a single error, or `None` if nothing failed
    pub fn to_error(&self) -> Option<CollectedError> {
        let inner = self.inner.lock();
        match inner.total_reported {
            0 => None,
            1 => inner.insertion_order.first().and_then(|id| {
                inner.errors_by_id.get(id).map(|error| CollectedError::Single {
                    id: id.clone(),
                    error: error.clone(),
                })
            }),
            count => Some(CollectedError::Multiple {
                count,
                message: render_message(&inner),
            }),
        }
    }
}

impl Default for ErrorCollector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

fn render_message(inner: &CollectorInner) -> String {
    if inner.total_reported == 0 {
        return "no errors".to_string();
    }

    if inner.total_reported == 1 {
        if let Some(err) = inner
            .insertion_order
            .first()
            .and_then(|id| inner.errors_by_id.get(id))
        {
            return err.to_string();
        }
    }

    let shown: Vec<String> = inner
        .insertion_order
        .iter()
        .take(SUMMARY_PREVIEW)
        .filter_map(|id| inner.errors_by_id.get(id).map(|err| format!("{id}: {err}")))
        .collect();

    let mut message = format!("{} errors occurred: {}", inner.total_reported, shown.join("; "));
    let remaining = inner.total_reported - shown.len();
    if remaining > 0 {
        message.push_str(&format!(" ...and {remaining} more"));
    }
    message
}

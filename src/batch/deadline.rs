//! Safe-deadline arithmetic and deadline-aware chunk sizing

use std::time::Duration;

use tokio::time::Instant;

/// Deadline derived from a caller's deadline minus a buffer
#[derive(Debug, Clone, Copy)]
pub struct DeadlinePlan {
    safe_deadline: Option<Instant>,
}

impl DeadlinePlan {
    /// Plan for an optional caller deadline
    pub fn new(deadline: Option<Instant>, buffer: Duration) -> Self {
        Self {
            safe_deadline: deadline.map(|d| safe_deadline(d, buffer)),
        }
    }

    /// Plan with no deadline at all
    pub fn unbounded() -> Self {
        Self { safe_deadline: None }
    }

    /// The safe deadline, if the caller supplied a deadline
    pub fn safe_deadline(&self) -> Option<Instant> {
        self.safe_deadline
    }

    /// Time left before the safe deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.safe_deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// The safe deadline has passed
    pub fn expired(&self) -> bool {
        self.safe_deadline
            .map(|d| Instant::now() >= d)
            .unwrap_or(false)
    }

    /// Chunk size for the next chunk
    pub fn chunk_size(&self, base: usize) -> usize {
        chunk_size_for(base, self.remaining())
    }

    /// Resolves at the safe deadline; never resolves without one
    pub async fn expiry(&self) {
        match self.safe_deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }
}

/// Caller deadline minus buffer, saturating at "now"
pub fn safe_deadline(deadline: Instant, buffer: Duration) -> Instant {
    deadline.checked_sub(buffer).unwrap_or_else(Instant::now)
}

/// Shrink `base` as the remaining time drops.
///
/// Under 30s → at most 5, under 60s → at most 10, under 120s → at most 15.
pub fn chunk_size_for(base: usize, remaining: Option<Duration>) -> usize {
    let size = match remaining {
        Some(r) if r < Duration::from_secs(30) => base.min(5),
        Some(r) if r < Duration::from_secs(60) => base.min(10),
        Some(r) if r < Duration::from_secs(120) => base.min(15),
        _ => base,
    };
    size.max(1)
}

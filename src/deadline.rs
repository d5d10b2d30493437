//! Deadline enforcement around connection attempts and resource loads.
//!
//! Loaders are expected to honour their deadline themselves, but the coordinator and the
//! controller wrap every call with [`with_deadline`] as well: a collaborator that overruns
//! is abandoned and reported as a timeout instead of holding a concurrency slot.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Returned when a future did not complete before its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineExceeded {
    /// Time the future was allowed to run.
    pub budget: Duration,
}

impl std::fmt::Display for DeadlineExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "deadline exceeded after {:?}", self.budget)
    }
}

impl std::error::Error for DeadlineExceeded {}

/// Run `future` until `deadline`, dropping it if the deadline passes first.
pub async fn with_deadline<F>(deadline: Instant, future: F) -> Result<F::Output, DeadlineExceeded>
where
    F: Future,
{
    let start = Instant::now();
    tokio::time::timeout_at(deadline, future)
        .await
        .map_err(|_| DeadlineExceeded { budget: deadline.saturating_duration_since(start) })
}

/// Deadline `budget` from now. Saturates instead of panicking on absurd budgets.
pub fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget).unwrap_or_else(|| now + Duration::from_secs(24 * 60 * 60 * 365))
}

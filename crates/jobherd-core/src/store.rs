//! Delayed-job store interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{CoreResult, JobEnvelope, JobId};

/// Persistent, due-time ordered store of scheduled jobs.
///
/// Records are ordered by `due_at` ascending, ties broken by insertion
/// order, so equally-due jobs are promoted first-scheduled first.
#[async_trait]
pub trait DelayedStore: Send + Sync {
    /// Persists a job whose `due_at` is set
    async fn schedule(
        &self,
        function: &str,
        envelope: &JobEnvelope,
        background: bool,
    ) -> CoreResult<JobId>;

    /// Moves the earliest job due at `now` into the broker queue.
    ///
    /// Claiming, removal and re-submission happen as one unit: on success the
    /// job is queued with `due_at` cleared and is gone from the store; on
    /// failure it stays in the store untouched.
    async fn promote_due(&self, now: DateTime<Utc>) -> CoreResult<Option<JobEnvelope>>;

    /// Number of jobs waiting in the store
    async fn pending(&self) -> CoreResult<usize>;

    /// Returns true if the store still holds the job
    async fn contains(&self, id: &JobId) -> CoreResult<bool>;
}

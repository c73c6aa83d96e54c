//! Delayed-job promotion.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use jobherd_core::{DelayedStore, JobEnvelope};

use crate::state::ProcessFlags;
use crate::{WorkerErrorKind, WorkerResult};

/// Moves due jobs from the delayed store into the broker queue.
///
/// A single sequential loop: promotion is low frequency and tolerant of
/// latency, so there is no internal concurrency.
pub struct DelayedScheduler {
    store: Arc<dyn DelayedStore>,
    interval: Duration,
}

impl DelayedScheduler {
    /// Creates a scheduler polling every `poll_interval_secs` seconds
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the interval is zero.
    pub fn new(store: Arc<dyn DelayedStore>, poll_interval_secs: u64) -> WorkerResult<Self> {
        if poll_interval_secs == 0 {
            return Err(WorkerErrorKind::InvalidArgument {
                reason: "scheduler poll interval must be greater than zero".to_string(),
            }
            .into());
        }
        Ok(Self {
            store,
            interval: Duration::from_secs(poll_interval_secs),
        })
    }

    /// Sleep between polls when nothing is due
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Promotes the earliest job due at `now`, if any
    ///
    /// # Errors
    ///
    /// Returns the store's error; the job then stays in the store.
    pub async fn tick(&self, now: DateTime<Utc>) -> WorkerResult<Option<JobEnvelope>> {
        let promoted = self.store.promote_due(now).await?;
        if let Some(envelope) = &promoted {
            info!(
                job_id = %envelope.id,
                task = %envelope.task,
                config_name = %envelope.config_name,
                "Job promoted"
            );
        }
        Ok(promoted)
    }

    /// Runs until a stop is requested.
    ///
    /// Due jobs are drained back to back; the loop only sleeps once nothing
    /// is due or the store fails.
    pub async fn run(&self, flags: &ProcessFlags) {
        info!(interval = ?self.interval, "Scheduler starting");
        while flags.is_running() {
            match self.tick(Utc::now()).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!("No job due");
                    flags.sleep(self.interval).await;
                }
                Err(e) => {
                    error!(error = %e, "Promotion failed");
                    flags.sleep(self.interval).await;
                }
            }
        }
        info!("Scheduler stopped");
    }
}

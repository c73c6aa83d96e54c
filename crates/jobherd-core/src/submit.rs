//! Job submission.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::{Broker, CoreError, CoreResult, DelayedStore, JobEnvelope, JobHandle, JobId, Priority};

/// Options recognized by [`Submitter::submit`]
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Return a handle instead of waiting for the result
    pub background: bool,
    /// Job priority
    pub priority: Priority,
    /// Hold the job in the delayed store until this time
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl SubmitOptions {
    /// Fire-and-forget submission
    #[must_use]
    pub fn background() -> Self {
        Self {
            background: true,
            ..Self::default()
        }
    }

    /// Sets the priority
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the scheduled time
    #[must_use]
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// What happened to a submitted job
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Written to the delayed store
    Scheduled(JobId),
    /// Queued in the background
    Queued(JobHandle),
    /// Ran to completion; `None` when the worker reported a null result
    Completed(Option<Value>),
}

impl Submission {
    /// ID of the submitted job when known
    #[must_use]
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::Scheduled(id) => Some(id),
            Self::Queued(handle) => Some(&handle.id),
            Self::Completed(_) => None,
        }
    }
}

/// Submits jobs to the broker or the delayed store
#[derive(Clone)]
pub struct Submitter {
    broker: Arc<dyn Broker>,
    store: Arc<dyn DelayedStore>,
    function: String,
    result_timeout: Duration,
}

impl Submitter {
    /// Creates a submitter for a function name
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn DelayedStore>,
        function: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            store,
            function: function.into(),
            result_timeout: Duration::from_secs(30),
        }
    }

    /// Sets how long foreground submissions wait for a result
    #[must_use]
    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }

    /// Submits a job
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the broker or store fails, or if a foreground
    /// job produces no result within the result timeout.
    pub async fn submit(
        &self,
        config_name: &str,
        task: &str,
        args: Vec<Value>,
        options: SubmitOptions,
    ) -> CoreResult<Submission> {
        let envelope = JobEnvelope::new(config_name, task, args).with_priority(options.priority);

        if let Some(at) = options.scheduled_at {
            let envelope = envelope.with_due_at(at);
            let id = self
                .store
                .schedule(&self.function, &envelope, options.background)
                .await?;
            return Ok(Submission::Scheduled(id));
        }

        let handle = self
            .broker
            .submit(&self.function, &envelope, options.background)
            .await?;
        info!(job_id = %handle.id, task, "Job submitted");

        if options.background {
            return Ok(Submission::Queued(handle));
        }
        self.await_result(&handle).await.map(Submission::Completed)
    }

    /// Waits for a foreground job, including one promoted from the store
    ///
    /// # Errors
    ///
    /// Returns `Transport` on broker failure or when the timeout expires.
    pub async fn await_job(&self, id: &JobId, timeout: Duration) -> CoreResult<Option<Value>> {
        let handle = JobHandle {
            id: id.clone(),
            function: self.function.clone(),
        };
        self.wait(&handle, timeout).await
    }

    async fn await_result(&self, handle: &JobHandle) -> CoreResult<Option<Value>> {
        self.wait(handle, self.result_timeout).await
    }

    async fn wait(&self, handle: &JobHandle, timeout: Duration) -> CoreResult<Option<Value>> {
        match self.broker.wait_result(handle, timeout).await? {
            Some(outcome) => Ok(outcome.result),
            None => Err(CoreError::transport(format!(
                "no result for job {} within {timeout:?}",
                handle.id
            ))),
        }
    }
}

//! Job broker interface.
//!
//! The broker accepts submitted jobs and hands them out to registered
//! workers. Jobherd talks to it only through the [`Broker`] trait.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::{CoreResult, JobEnvelope, JobId};

/// Handle of a job accepted by the broker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    /// ID of the job the handle refers to
    pub id: JobId,
    /// Function the job was queued under
    pub function: String,
}

/// How a worker asks for its next job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabMode {
    /// Wait until a job arrives or the transport fails
    Blocking,
    /// Return [`Grab::NoJob`] immediately when nothing is queued
    NonBlocking,
}

/// A job claimed by a worker
#[derive(Debug, Clone)]
pub struct AssignedJob {
    /// Handle used to report completion
    pub handle: JobHandle,
    /// Raw payload, decoded by the worker
    pub payload: String,
}

/// Result of a grab request
#[derive(Debug, Clone)]
pub enum Grab {
    /// A job was claimed
    Job(AssignedJob),
    /// Nothing queued right now
    NoJob,
}

/// Completed job as seen by a foreground submitter
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    /// Value returned by the task, `None` when the worker reported null
    pub result: Option<Value>,
}

/// Job broker trait
#[async_trait]
pub trait Broker: Send + Sync {
    /// Queues a job for immediate execution
    async fn submit(
        &self,
        function: &str,
        envelope: &JobEnvelope,
        background: bool,
    ) -> CoreResult<JobHandle>;

    /// Registers a worker for a function
    async fn register(&self, function: &str, worker: u32) -> CoreResult<()>;

    /// Removes a worker registration
    async fn unregister(&self, function: &str, worker: u32) -> CoreResult<()>;

    /// Claims the next job queued under a function
    async fn grab(&self, function: &str, worker: u32, mode: GrabMode) -> CoreResult<Grab>;

    /// Reports a claimed job as done
    async fn complete(&self, handle: &JobHandle, result: Option<&Value>) -> CoreResult<()>;

    /// Waits for a foreground job to complete, `None` on timeout
    async fn wait_result(&self, handle: &JobHandle, timeout: Duration)
    -> CoreResult<Option<JobOutcome>>;

    /// Number of workers registered for a function
    async fn registered_workers(&self, function: &str) -> CoreResult<usize>;

    /// Number of jobs waiting under a function
    async fn queued(&self, function: &str) -> CoreResult<usize>;
}

//! The worker loop.
//!
//! A worker registers under one function name, then pulls jobs from the
//! broker, hands them to the dispatch façade and reports the result until it
//! is told to stop.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, error, info, warn};

use jobherd_core::{Broker, Grab, GrabMode, JobEnvelope, TaskResolver, dispatch};

use crate::signals::{self, Signal};
use crate::state::ProcessFlags;
use crate::{EXIT_ABORT, WorkerError, WorkerErrorKind};

/// Worker options
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Function name jobs are queued under
    pub function: String,
    /// Block in the broker while waiting for a job
    pub blocking: bool,
    /// Exit after exactly one job
    pub atomic: bool,
    /// Sleep after an empty poll
    pub poll_interval: Duration,
    /// Sleep after a transport error in blocking mode
    pub backoff: Duration,
    /// Running under a supervisor that expects SIGUSR2 on startup failure
    pub supervised: bool,
}

impl WorkerOptions {
    /// Options with default timings for `function`
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            blocking: false,
            atomic: false,
            poll_interval: Duration::from_millis(250),
            backoff: Duration::from_secs(5),
            supervised: false,
        }
    }
}

/// A single job-executing process
pub struct Worker {
    broker: Arc<dyn Broker>,
    resolver: Arc<dyn TaskResolver>,
    flags: Arc<ProcessFlags>,
    options: WorkerOptions,
}

impl Worker {
    /// Creates a worker; nothing touches the broker before [`Worker::run`]
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        resolver: Arc<dyn TaskResolver>,
        flags: Arc<ProcessFlags>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            broker,
            resolver,
            flags,
            options,
        }
    }

    /// Serves jobs until stopped and returns the process exit status.
    ///
    /// `0` after a normal stop, `1` when a polling worker loses the broker
    /// and [`EXIT_ABORT`] when registration fails.
    pub async fn run(&self) -> i32 {
        let pid = std::process::id();
        let function = self.options.function.as_str();

        if let Err(e) = self.broker.register(function, pid).await {
            return abort_startup(&e.to_string(), self.options.supervised);
        }
        info!(
            function,
            blocking = self.options.blocking,
            atomic = self.options.atomic,
            "Worker ready"
        );

        let exit_code = self.serve(pid).await;

        if let Err(e) = self.broker.unregister(function, pid).await {
            warn!(error = %e, function, "Could not unregister worker");
        }
        info!(exit_code, "Worker stopped");
        exit_code
    }

    async fn serve(&self, pid: u32) -> i32 {
        let function = self.options.function.as_str();
        let mode = if self.options.blocking {
            GrabMode::Blocking
        } else {
            GrabMode::NonBlocking
        };

        while self.flags.is_running() {
            match self.broker.grab(function, pid, mode).await {
                Ok(Grab::Job(job)) => {
                    let result = self.do_work(&job.payload).await;
                    if let Err(e) = self.broker.complete(&job.handle, result.as_ref()).await {
                        warn!(job_id = %job.handle.id, error = %e, "Could not report job completion");
                    }
                    if self.options.atomic {
                        debug!("Atomic worker finished its job");
                        self.flags.request_stop();
                    } else {
                        tokio::task::yield_now().await;
                    }
                }
                Ok(Grab::NoJob) => self.flags.sleep(self.options.poll_interval).await,
                Err(e) if self.options.blocking => {
                    warn!(error = %e, backoff = ?self.options.backoff, "Broker unavailable, retrying");
                    self.flags.sleep(self.options.backoff).await;
                }
                Err(e) => {
                    error!(error = %e, "Broker error, worker leaving");
                    return 1;
                }
            }
        }
        0
    }

    /// Decodes and executes one job payload.
    ///
    /// Never fails: malformed payloads, task errors and task panics are
    /// logged and yield `None`, which is reported to the broker as a null
    /// result.
    pub async fn do_work(&self, payload: &str) -> Option<Value> {
        let envelope = match JobEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "Discarding malformed job");
                return None;
            }
        };

        info!(
            job_id = %envelope.id,
            task = %envelope.task,
            config_name = %envelope.config_name,
            "Job started"
        );
        // Own task so a panicking adapter only loses this job.
        let resolver = Arc::clone(&self.resolver);
        let JobEnvelope {
            id,
            config_name,
            task,
            args,
            ..
        } = envelope;
        let name = task.clone();
        let handle = tokio::spawn(
            async move { dispatch(resolver.as_ref(), &config_name, &task, &args).await }
                .in_current_span(),
        );
        match handle.await {
            Ok(Ok(value)) => {
                info!(job_id = %id, "Job finished");
                Some(value)
            }
            Ok(Err(e)) => {
                error!(job_id = %id, task = %name, error = %e, "Job failed");
                None
            }
            Err(e) if e.is_panic() => {
                error!(job_id = %id, task = %name, "Job panicked");
                None
            }
            Err(e) => {
                error!(job_id = %id, task = %name, error = %e, "Job was cancelled");
                None
            }
        }
    }
}

/// Reports a worker that could not establish service.
///
/// Logs the failure, sends SIGUSR2 to the supervising parent when there is
/// one and returns [`EXIT_ABORT`] for the process to exit with.
pub fn abort_startup(reason: &str, supervised: bool) -> i32 {
    let err = WorkerError::from(WorkerErrorKind::Registration {
        reason: reason.to_string(),
    });
    error!(error = %err, "Worker could not start");
    if supervised {
        let parent = std::os::unix::process::parent_id();
        if let Err(e) = signals::send(parent, Signal::User2) {
            warn!(parent, error = %e, "Could not notify supervisor");
        }
    }
    EXIT_ABORT
}

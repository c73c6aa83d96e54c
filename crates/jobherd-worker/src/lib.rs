//! # Jobherd Worker
//!
//! Process supervision and scheduling engine for jobherd. This crate provides
//! the worker pool supervisor, the worker loop, and the delayed-job scheduler.
//!
//! ## Architecture
//!
//! The worker is organized around:
//!
//! - `state`: Per-process flags and worker pool bookkeeping
//! - `signals`: OS signal to intent mapping
//! - `pidfile`: PID record used to find a running daemon
//! - `process`: Worker child-process spawning and reaping
//! - `pool`: The supervision loop
//! - `worker`: The pull-execute-report loop run inside each worker process
//! - `scheduler`: Promotion of due jobs from the delayed store
//! - `daemon`: `start`, `shutdown` and `restart` control operations
//!
//! ## Example
//!
//! ```rust,ignore
//! use jobherd_worker::{CommandSpawner, ProcessFlags, Role, Supervisor, SupervisorConfig};
//!
//! let flags = ProcessFlags::new(Role::Daemon);
//! let spawner = CommandSpawner::current_exe(["work", "default", "--supervised"])?;
//! let mut supervisor = Supervisor::new(SupervisorConfig::default(), spawner, flags);
//! let exit_code = supervisor.run().await;
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod daemon;
pub mod pidfile;
pub mod pool;
pub mod process;
pub mod scheduler;
pub mod signals;
pub mod state;
pub mod worker;

pub use daemon::{DaemonStatus, StartOptions, detach, restart, shutdown, start, start_with, status};
pub use pidfile::PidFile;
pub use pool::{Supervisor, SupervisorConfig};
pub use process::{ChildWorker, CommandSpawner, Exit, Spawner, WorkerProcess};
pub use scheduler::DelayedScheduler;
pub use signals::{Intent, Signal};
pub use state::{Lifecycle, ProcessFlags, Role, WorkerPoolState};
pub use worker::{Worker, WorkerOptions, abort_startup};

/// Re-exports
pub use jobherd_core::{Broker, DelayedStore, JobEnvelope, TaskResolver};

use std::path::PathBuf;

/// Worker exit status after a registration failure
pub const EXIT_ABORT: i32 = 3;

/// Worker error types
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct WorkerError(#[from] WorkerErrorKind);

#[derive(Debug, thiserror::Error)]
pub enum WorkerErrorKind {
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("daemon already running with pid {pid} (pid file {path})")]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("no running daemon found: {reason} (pid file {path})")]
    NotRunning { reason: String, path: PathBuf },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("worker registration failed: {reason}")]
    Registration { reason: String },

    #[error("restart limit of {limit} workers reached")]
    RestartLimitExceeded { limit: u64 },

    #[error(transparent)]
    Core(#[from] jobherd_core::CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Returns the underlying error kind
    #[must_use]
    pub fn kind(&self) -> &WorkerErrorKind {
        &self.0
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        WorkerErrorKind::Configuration {
            reason: reason.into(),
        }
        .into()
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(e: std::io::Error) -> Self {
        Self(WorkerErrorKind::Io(e))
    }
}

impl From<jobherd_core::CoreError> for WorkerError {
    fn from(e: jobherd_core::CoreError) -> Self {
        Self(WorkerErrorKind::Core(e))
    }
}

/// Worker result type
pub type WorkerResult<T = ()> = Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WorkerError::from(WorkerErrorKind::AlreadyRunning {
            pid: 42,
            path: PathBuf::from("/run/jobherd.pid"),
        });
        assert_eq!(
            err.to_string(),
            "daemon already running with pid 42 (pid file /run/jobherd.pid)"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let err: WorkerError = std::io::Error::other("boom").into();
        assert!(matches!(err.kind(), WorkerErrorKind::Io(_)));
    }
}

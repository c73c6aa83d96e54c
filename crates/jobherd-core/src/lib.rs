//! # Jobherd Core
//!
//! Job envelope and the broker-facing interfaces for jobherd.
//!
//! This crate defines the unit of work that travels through the system and
//! the seams the daemon depends on: the job broker, the delayed-job store,
//! and the dispatch façade that turns a task identifier into an invocation.
//!
//! ## Architecture
//!
//! - `envelope`: `JobEnvelope`, `JobId`, `Priority` and the payload codec
//! - `broker`: the `Broker` trait (submit, register, grab, complete)
//! - `store`: the `DelayedStore` trait (schedule, promote)
//! - `sqlite`: `SqliteBackend`, a shared-file implementation of both
//! - `dispatch`: `Task`, `TaskResolver` and the built-in `TaskRegistry`
//! - `submit`: the `Submitter` used by callers to enqueue or schedule jobs
//!
//! ## Example
//!
//! ```rust,ignore
//! use jobherd_core::{SqliteBackend, Submitter, SubmitOptions};
//!
//! let backend = SqliteBackend::connect("sqlite://jobherd.db").await?;
//! let submitter = Submitter::new(backend.clone(), backend, "jobherd:default");
//! let job = submitter
//!     .submit("default", "echo", vec!["hello".into()], SubmitOptions::background())
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(unused)]
#![warn(clippy::pedantic)]

pub mod broker;
pub mod dispatch;
pub mod envelope;
pub mod sqlite;
pub mod store;
pub mod submit;

pub use broker::{AssignedJob, Broker, Grab, GrabMode, JobHandle, JobOutcome};
pub use dispatch::{CommandTask, DispatchError, Task, TaskRegistry, TaskResolver, dispatch};
pub use envelope::{JobEnvelope, JobId, Priority};
pub use sqlite::SqliteBackend;
pub use store::DelayedStore;
pub use submit::{SubmitOptions, Submission, Submitter};

/// Core error type
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct CoreError(#[from] CoreErrorKind);

/// Specific error kinds
#[derive(Debug, thiserror::Error)]
pub enum CoreErrorKind {
    /// The job payload was empty or did not decode into an envelope
    #[error("malformed job payload: {reason}")]
    MalformedPayload { reason: String },

    /// The broker or store could not be reached or rejected an operation
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// Missing or invalid configuration
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// An argument was outside its accepted range
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
}

impl CoreError {
    /// Returns the underlying error kind
    #[must_use]
    pub fn kind(&self) -> &CoreErrorKind {
        &self.0
    }

    /// Returns true for broker connectivity failures
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self.0, CoreErrorKind::Transport { .. })
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        CoreErrorKind::MalformedPayload {
            reason: reason.into(),
        }
        .into()
    }

    pub(crate) fn transport(reason: impl Into<String>) -> Self {
        CoreErrorKind::Transport {
            reason: reason.into(),
        }
        .into()
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::transport(e.to_string())
    }
}

/// Core result type
pub type CoreResult<T = ()> = Result<T, CoreError>;

/// Name of the single task handler a worker registers.
///
/// Every daemon with the same identity and configuration name serves the
/// same function, so jobs can be submitted by any of them.
#[must_use]
pub fn function_name(identity: &str, config_name: &str) -> String {
    format!("{identity}:{config_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_name_is_deterministic() {
        assert_eq!(function_name("jobherd", "default"), "jobherd:default");
        assert_eq!(
            function_name("jobherd", "default"),
            function_name("jobherd", "default")
        );
    }

    #[test]
    fn test_core_error_kind() {
        let err = CoreError::transport("connection refused");
        assert!(err.is_transport());
        assert_eq!(err.to_string(), "transport error: connection refused");

        let err = CoreError::malformed("empty");
        assert!(!err.is_transport());
        assert!(matches!(err.kind(), CoreErrorKind::MalformedPayload { .. }));
    }
}

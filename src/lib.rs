//! # Jobherd - a job-worker daemon
//!
//! Jobherd runs a pool of worker processes that pull jobs from a broker and
//! execute them, plus a scheduler process that promotes delayed jobs once
//! they are due.
//!
//! The engine lives in two workspace crates:
//!
//! - `jobherd-core`: job envelopes, broker and delayed-store interfaces, the
//!   SQLite backend, task dispatch and submission
//! - `jobherd-worker`: the process supervisor, the worker loop, the delayed
//!   job scheduler and daemon control
//!
//! This crate adds configuration, logging and the `jobherd` command line.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run two workers in the background, replacing any that exit
//! jobherd start --daemon --workers 2 --resuscitate
//!
//! # Promote delayed jobs every second
//! jobherd scheduler 1
//!
//! # Check that a worker answers
//! jobherd ping
//!
//! # Rolling restart, then stop
//! jobherd restart
//! jobherd shutdown
//! ```
//!
//! ## License
//!
//! Licensed under either of
//! - Apache License, Version 2.0 ([LICENSE-APACHE](LICENSE-APACHE) or <https://www.apache.org/licenses/LICENSE-2.0>)
//! - MIT license ([LICENSE-MIT](LICENSE-MIT) or <https://opensource.org/licenses/MIT>)
//!
//! at your option.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod infrastructure;

pub use infrastructure::{Config, ConfigError, LogConfig, LogFormat};

/// Version of the jobherd crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

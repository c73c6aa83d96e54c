//! jobherd - a job-worker daemon
//!
//! Runs a supervised pool of worker processes that pull jobs from a
//! SQLite-backed broker, plus a scheduler that promotes delayed jobs once
//! they are due.
//!
//! ## Commands
//!
//! - `jobherd start` - Run the worker daemon (`--daemon` to detach)
//! - `jobherd shutdown` - Gracefully stop the daemon
//! - `jobherd restart` - Replace every worker with a fresh process
//! - `jobherd status` - Show daemon and queue state
//! - `jobherd scheduler` - Promote delayed jobs
//! - `jobherd ping` - Check that a worker answers
//! - `jobherd submit` - Submit a job
//! - `jobherd completions` - Generate shell completions
//!
//! ## Quick Start
//!
//! ```bash
//! # Four workers, replaced when they exit
//! jobherd start --workers 4 --resuscitate --daemon
//!
//! # Delayed jobs need a scheduler
//! jobherd scheduler &
//!
//! # Round trip through a worker, then one due in 10 seconds
//! jobherd ping
//! jobherd ping default 10
//!
//! jobherd shutdown
//! ```

use std::process::ExitCode;

mod cli;

#[tokio::main]
async fn main() -> ExitCode {
    match cli::run().await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

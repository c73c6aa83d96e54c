//! Logging configuration
//!
//! Initializes tracing for the application.

use std::fs::OpenOptions;
use std::io;
use std::sync::Mutex;
use tracing::Span;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt};

use super::config::{LogConfig, LogFormat};

/// Initializes logging; `RUST_LOG` wins over the configured level and
/// `verbose` forces `debug`
///
/// # Errors
///
/// Returns an error if the configured log file cannot be opened.
pub fn init_logging(config: &LogConfig, verbose: bool) -> io::Result<()> {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (writer, ansi) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    // A subscriber may already be set, e.g. by another test.
    let _ = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    Ok(())
}

/// Span tagging every line of a process with its role and PID
#[must_use]
pub fn process_span(role: &str) -> Span {
    tracing::info_span!("process", role, pid = std::process::id())
}

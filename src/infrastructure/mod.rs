//! Infrastructure layer
//!
//! Configuration loading and log setup shared by every command.

mod config;
mod logging;

pub use config::{
    CONFIG_ENV, Config, ConfigError, ConnectionConfig, DATABASE_URL_ENV, LogConfig, LogFormat,
    PID_FILE_ENV, TaskConfig, resolve_path,
};
pub use logging::{init_logging, process_span};

//! Configuration management
//!
//! Settings come from a YAML file, then environment overrides, then command
//! line flags (applied by the CLI).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use jobherd_core::{CommandTask, TaskRegistry, function_name};
use jobherd_worker::{SupervisorConfig, WorkerOptions};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "JOBHERD_CONFIG";
/// Environment variable overriding the PID file location
pub const PID_FILE_ENV: &str = "JOBHERD_PID_FILE";
/// Environment variable overriding the default connection's database
pub const DATABASE_URL_ENV: &str = "JOBHERD_DATABASE_URL";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("configuration error: {0}")]
    Invalid(String),
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level filter used when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
    /// Append to this file instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// A named broker/store connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// `sqlite:` URL
    pub database: String,
}

/// An external command exposed as a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub command: String,
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Daemon identity, the first half of every function name
    pub identity: String,
    pub default_connection: String,
    pub connections: BTreeMap<String, ConnectionConfig>,
    pub pid_file: PathBuf,
    pub workers: usize,
    pub limit: u64,
    pub resuscitate: bool,
    pub atomic: bool,
    pub blocking: bool,
    pub poll_interval_ms: u64,
    pub backoff_secs: u64,
    pub tick_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub blocking_grace_secs: u64,
    pub result_timeout_secs: u64,
    pub log: LogConfig,
    pub tasks: BTreeMap<String, TaskConfig>,
    /// File the configuration was read from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let mut connections = BTreeMap::new();
        connections.insert(
            "default".to_string(),
            ConnectionConfig {
                database: "sqlite://jobherd.db".to_string(),
            },
        );
        Self {
            identity: "jobherd".to_string(),
            default_connection: "default".to_string(),
            connections,
            pid_file: PathBuf::from("jobherd.pid"),
            workers: 1,
            limit: 0,
            resuscitate: false,
            atomic: false,
            blocking: false,
            poll_interval_ms: 250,
            backoff_secs: 5,
            tick_ms: 150,
            shutdown_timeout_secs: 30,
            blocking_grace_secs: 2,
            result_timeout_secs: 30,
            log: LogConfig::default(),
            tasks: BTreeMap::new(),
            source: None,
        }
    }
}

impl Config {
    /// Loads, overrides and validates the configuration for this process
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// result is invalid.
    pub fn load(explicit: Option<&Path>, env: Option<&str>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| std::env::var(key).ok();
        let mut config = match resolve_path(explicit, env, lookup, Path::new(".")) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Reads a YAML file
    ///
    /// # Errors
    ///
    /// Returns `Read` or `Parse` errors naming the file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Applies environment overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(pid_file) = lookup(PID_FILE_ENV) {
            self.pid_file = PathBuf::from(pid_file);
        }
        if let Some(database) = lookup(DATABASE_URL_ENV) {
            self.connections
                .insert(self.default_connection.clone(), ConnectionConfig { database });
        }
    }

    /// Checks the configuration for values the daemon cannot run with
    ///
    /// # Errors
    ///
    /// Returns `Invalid` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.trim().is_empty() {
            return Err(ConfigError::Invalid("identity must not be empty".to_string()));
        }
        if !self.connections.contains_key(&self.default_connection) {
            return Err(ConfigError::Invalid(format!(
                "default connection '{}' is not defined",
                self.default_connection
            )));
        }
        if let Some((name, _)) = self
            .connections
            .iter()
            .find(|(_, c)| !c.database.starts_with("sqlite:"))
        {
            return Err(ConfigError::Invalid(format!(
                "connection '{name}' must use a sqlite: database url"
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".to_string()));
        }
        if self.tick_ms == 0 {
            return Err(ConfigError::Invalid("tick_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Connection for a configuration name
    ///
    /// # Errors
    ///
    /// Returns `Invalid` if the name is not configured.
    pub fn connection(&self, name: &str) -> Result<&ConnectionConfig, ConfigError> {
        self.connections
            .get(name)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown connection '{name}'")))
    }

    /// Configuration name to use when none is given
    #[must_use]
    pub fn config_name(&self, requested: Option<String>) -> String {
        requested.unwrap_or_else(|| self.default_connection.clone())
    }

    /// Function name workers register for `config_name`
    #[must_use]
    pub fn function(&self, config_name: &str) -> String {
        function_name(&self.identity, config_name)
    }

    /// Supervisor settings before command line overrides
    #[must_use]
    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            workers: self.workers,
            limit: self.limit,
            resuscitate: self.resuscitate,
            atomic: self.atomic,
            blocking: self.blocking,
            tick: Duration::from_millis(self.tick_ms),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            blocking_grace: Duration::from_secs(self.blocking_grace_secs),
        }
    }

    /// Worker settings for `config_name`
    #[must_use]
    pub fn worker_options(&self, config_name: &str) -> WorkerOptions {
        WorkerOptions {
            blocking: self.blocking,
            atomic: self.atomic,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            backoff: Duration::from_secs(self.backoff_secs),
            ..WorkerOptions::new(self.function(config_name))
        }
    }

    /// How long foreground submissions wait for their result
    #[must_use]
    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs)
    }

    /// Built-in tasks plus the configured command tasks
    ///
    /// # Errors
    ///
    /// Returns `Invalid` if a command line cannot be parsed.
    pub fn task_registry(&self) -> Result<TaskRegistry, ConfigError> {
        let mut registry = TaskRegistry::with_builtins();
        for (name, task) in &self.tasks {
            let command = CommandTask::parse(name, &task.command)
                .map_err(|e| ConfigError::Invalid(format!("task '{name}': {e}")))?;
            registry = registry.with_task(name, command);
        }
        Ok(registry)
    }
}

/// Picks the configuration file: explicit path, then `$JOBHERD_CONFIG`, then
/// `jobherd.<env>.yaml` or `jobherd.yaml` in `dir` when present
pub fn resolve_path(
    explicit: Option<&Path>,
    env: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
    dir: &Path,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = lookup(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    let file_name = env.map_or_else(|| "jobherd.yaml".to_string(), |e| format!("jobherd.{e}.yaml"));
    let candidate = dir.join(file_name);
    candidate.is_file().then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobherd_core::TaskResolver;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const SAMPLE: &str = r#"
identity: billing
default_connection: main
connections:
  main: { database: "sqlite://main.db" }
  reports: { database: "sqlite::memory:" }
workers: 4
atomic: true
log: { level: debug, format: json }
tasks:
  report: { command: "/usr/local/bin/report --fast" }
"#;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.identity, "jobherd");
        assert_eq!(config.log.level, "info");
        assert_eq!(config.supervisor(), SupervisorConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.identity, "billing");
        assert_eq!(config.workers, 4);
        assert!(config.atomic);
        assert_eq!(config.tick_ms, 150);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.function("reports"), "billing:reports");
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.apply_overrides(|key| match key {
            PID_FILE_ENV => Some("/run/billing.pid".to_string()),
            DATABASE_URL_ENV => Some("sqlite:///var/lib/billing.db".to_string()),
            _ => None,
        });
        assert_eq!(config.pid_file, PathBuf::from("/run/billing.pid"));
        assert_eq!(config.connection("main").unwrap().database, "sqlite:///var/lib/billing.db");
        assert_eq!(config.connection("reports").unwrap().database, "sqlite::memory:");
    }

    #[rstest]
    #[case("identity: ''", "identity")]
    #[case("default_connection: other", "other")]
    #[case("connections: { default: { database: 'mysql://x' } }", "sqlite:")]
    #[case("poll_interval_ms: 0", "poll_interval_ms")]
    #[case("tick_ms: 0", "tick_ms")]
    fn test_validation_errors(#[case] yaml: &str, #[case] mentioned: &str) {
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains(mentioned), "{err}");
    }

    #[test]
    fn test_unknown_connection() {
        let config = Config::default();
        assert!(matches!(config.connection("nope"), Err(ConfigError::Invalid(_))));
        assert_eq!(config.config_name(None), "default");
        assert_eq!(config.config_name(Some("x".to_string())), "x");
    }

    #[test]
    fn test_resolve_path_order() {
        let dir = tempfile::tempdir().unwrap();
        let none = |_: &str| None;

        assert_eq!(resolve_path(None, None, none, dir.path()), None);

        fs::write(dir.path().join("jobherd.yaml"), "workers: 2").unwrap();
        fs::write(dir.path().join("jobherd.staging.yaml"), "workers: 3").unwrap();
        assert_eq!(
            resolve_path(None, None, none, dir.path()),
            Some(dir.path().join("jobherd.yaml"))
        );
        assert_eq!(
            resolve_path(None, Some("staging"), none, dir.path()),
            Some(dir.path().join("jobherd.staging.yaml"))
        );

        let from_env = |key: &str| (key == CONFIG_ENV).then(|| "/etc/jobherd.yaml".to_string());
        assert_eq!(
            resolve_path(None, Some("staging"), from_env, dir.path()),
            Some(PathBuf::from("/etc/jobherd.yaml"))
        );
        assert_eq!(
            resolve_path(Some(Path::new("cli.yaml")), None, from_env, dir.path()),
            Some(PathBuf::from("cli.yaml"))
        );
    }

    #[test]
    fn test_from_file_records_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobherd.yaml");
        fs::write(&path, SAMPLE).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.source, Some(path));

        let missing = Config::from_file(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }

    #[test]
    fn test_task_registry_includes_commands() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let registry = config.task_registry().unwrap();
        assert!(registry.resolve("report").is_some());
        assert!(registry.resolve("ping").is_some());
    }

    #[test]
    fn test_worker_options() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let options = config.worker_options("main");
        assert_eq!(options.function, "billing:main");
        assert!(options.atomic);
        assert_eq!(options.poll_interval, Duration::from_millis(250));
    }
}

//! Job dispatch façade.
//!
//! Resolves a task identifier to something invocable. The daemon only knows
//! the [`TaskResolver`] trait; [`TaskRegistry`] is the resolver that ships
//! with the binary.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Errors raised while running a task
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// No task is registered under the identifier
    #[error("unknown task '{task}'")]
    UnknownTask {
        /// Identifier that failed to resolve
        task: String,
    },

    /// The task ran and failed
    #[error("task '{task}' failed: {reason}")]
    Failed {
        /// Identifier of the failing task
        task: String,
        /// Failure description
        reason: String,
    },
}

impl DispatchError {
    /// Builds a `Failed` error
    pub fn failed(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            task: task.into(),
            reason: reason.into(),
        }
    }
}

/// A unit of work that can be invoked by name
#[async_trait]
pub trait Task: Send + Sync {
    /// Runs the task with positional arguments
    async fn invoke(&self, config_name: &str, args: &[Value]) -> Result<Value, DispatchError>;
}

/// Resolves task identifiers
pub trait TaskResolver: Send + Sync {
    /// Returns the task registered under `task`, if any
    fn resolve(&self, task: &str) -> Option<Arc<dyn Task>>;
}

/// Resolves and invokes a task
///
/// # Errors
///
/// Returns `UnknownTask` when nothing resolves and whatever the task itself
/// fails with otherwise.
pub async fn dispatch(
    resolver: &dyn TaskResolver,
    config_name: &str,
    task: &str,
    args: &[Value],
) -> Result<Value, DispatchError> {
    let Some(handler) = resolver.resolve(task) else {
        return Err(DispatchError::UnknownTask {
            task: task.to_string(),
        });
    };
    debug!(task, config_name, "Dispatching task");
    handler.invoke(config_name, args).await
}

/// Name-to-task map
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn Task>>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.tasks.keys().collect();
        names.sort();
        f.debug_struct("TaskRegistry").field("tasks", &names).finish()
    }
}

impl TaskRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding `ping`, `echo` and `sleep`
    #[must_use]
    pub fn with_builtins() -> Self {
        Self::new()
            .with_task("ping", Ping)
            .with_task("echo", Echo)
            .with_task("sleep", Sleep)
    }

    /// Registers a task, replacing any previous one with the same name
    #[must_use]
    pub fn with_task(mut self, name: impl Into<String>, task: impl Task + 'static) -> Self {
        self.register(name, Arc::new(task));
        self
    }

    /// Registers a shared task
    pub fn register(&mut self, name: impl Into<String>, task: Arc<dyn Task>) {
        self.tasks.insert(name.into(), task);
    }

    /// Returns the number of registered tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if no task is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl TaskResolver for TaskRegistry {
    fn resolve(&self, task: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(task).cloned()
    }
}

struct Ping;

#[async_trait]
impl Task for Ping {
    async fn invoke(&self, _config_name: &str, _args: &[Value]) -> Result<Value, DispatchError> {
        Ok(json!("pong"))
    }
}

struct Echo;

#[async_trait]
impl Task for Echo {
    async fn invoke(&self, _config_name: &str, args: &[Value]) -> Result<Value, DispatchError> {
        Ok(Value::Array(args.to_vec()))
    }
}

struct Sleep;

#[async_trait]
impl Task for Sleep {
    async fn invoke(&self, _config_name: &str, args: &[Value]) -> Result<Value, DispatchError> {
        let secs = args
            .first()
            .and_then(Value::as_f64)
            .ok_or_else(|| DispatchError::failed("sleep", "expected a number of seconds"))?;
        let duration = Duration::try_from_secs_f64(secs)
            .map_err(|e| DispatchError::failed("sleep", format!("invalid duration {secs}: {e}")))?;
        tokio::time::sleep(duration).await;
        Ok(json!(true))
    }
}

/// Runs an external program with the job's arguments appended
#[derive(Debug, Clone)]
pub struct CommandTask {
    name: String,
    program: String,
    base_args: Vec<String>,
}

impl CommandTask {
    /// Parses a shell-style command line
    ///
    /// # Errors
    ///
    /// Returns `Failed` if the line is empty or has unbalanced quoting.
    pub fn parse(name: impl Into<String>, command_line: &str) -> Result<Self, DispatchError> {
        let name = name.into();
        let mut words = shell_words::split(command_line)
            .map_err(|e| DispatchError::failed(name.clone(), e.to_string()))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| DispatchError::failed(name.clone(), "empty command"))?;
        Ok(Self {
            name,
            program,
            base_args: words.collect(),
        })
    }

    fn render(arg: &Value) -> String {
        match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
impl Task for CommandTask {
    async fn invoke(&self, config_name: &str, args: &[Value]) -> Result<Value, DispatchError> {
        info!(task = %self.name, program = %self.program, "Running command task");

        let output = Command::new(&self.program)
            .args(&self.base_args)
            .args(args.iter().map(Self::render))
            .env("JOBHERD_CONFIG_NAME", config_name)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DispatchError::failed(&self.name, e.to_string()))?;

        let code = output.status.code().unwrap_or(-1);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DispatchError::failed(
                &self.name,
                format!("exit code {code}: {}", stderr.trim()),
            ));
        }

        Ok(json!({
            "status": code,
            "stdout": String::from_utf8_lossy(&output.stdout),
        }))
    }
}

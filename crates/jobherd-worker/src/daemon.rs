//! Daemon control: `start`, `shutdown`, `restart` and `status`.

use std::ffi::OsString;
use std::fmt;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{error, info};

use crate::pidfile::PidFile;
use crate::pool::{Supervisor, SupervisorConfig};
use crate::process::{Spawner, new_session};
use crate::signals::{self, Signal};
use crate::state::{ProcessFlags, Role};
use crate::{WorkerError, WorkerErrorKind, WorkerResult};

/// Options for starting the daemon
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Where the daemon records its PID
    pub pid_file: PidFile,
    /// Pool settings
    pub supervisor: SupervisorConfig,
}

/// What the PID record says about the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    /// A live daemon is recorded
    Running(u32),
    /// The recorded process is gone
    Stale(u32),
    /// Nothing is recorded
    NotRunning,
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running(pid) => write!(f, "running (pid {pid})"),
            Self::Stale(pid) => write!(f, "not running (stale pid {pid})"),
            Self::NotRunning => write!(f, "not running"),
        }
    }
}

/// Runs the daemon in the foreground until it stops.
///
/// Returns the daemon's exit code: 0 after a normal stop, 1 after a worker
/// abort.
///
/// # Errors
///
/// Returns `Configuration` when prerequisites are missing and
/// `AlreadyRunning` when a live daemon is recorded in the PID file.
pub async fn start<S: Spawner>(options: StartOptions, spawner: S) -> WorkerResult<i32> {
    start_with(options, spawner, ProcessFlags::new(Role::Daemon)).await
}

/// [`start`] driven by caller-provided flags
///
/// # Errors
///
/// See [`start`].
pub async fn start_with<S: Spawner>(
    options: StartOptions,
    spawner: S,
    flags: Arc<ProcessFlags>,
) -> WorkerResult<i32> {
    check_prerequisites(&options.pid_file)?;

    let pid = std::process::id();
    options.pid_file.acquire(pid)?;
    info!(pid, pid_file = %options.pid_file.path().display(), "Daemon starting");

    if let Err(e) = signals::install(&flags) {
        options.pid_file.remove()?;
        return Err(WorkerError::configuration(format!(
            "cannot install signal handlers: {e}"
        )));
    }

    let mut supervisor = Supervisor::new(options.supervisor, spawner, flags);
    let exit_code = supervisor.run().await;

    if let Err(e) = options.pid_file.remove() {
        error!(error = %e, "Could not remove PID record");
    }
    info!(exit_code, "Daemon stopped");
    Ok(exit_code)
}

fn check_prerequisites(pid_file: &PidFile) -> WorkerResult<()> {
    pid_file.check_writable()?;
    std::env::current_exe()
        .map_err(|e| WorkerError::configuration(format!("cannot locate own executable: {e}")))?;
    if !signals::is_alive(std::process::id()) {
        return Err(WorkerError::configuration("process signalling is unavailable"));
    }
    Ok(())
}

/// Re-executes the current binary with `args` as a background daemon.
///
/// The child gets its own session and null stdio. Returns its PID.
///
/// # Errors
///
/// Returns `Configuration` if the PID location is unusable and `Io` if the
/// child cannot be started.
pub fn detach<I, S>(pid_file: &PidFile, args: I) -> WorkerResult<u32>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    check_prerequisites(pid_file)?;
    if let DaemonStatus::Running(pid) = status(pid_file)? {
        return Err(WorkerErrorKind::AlreadyRunning {
            pid,
            path: pid_file.path().to_path_buf(),
        }
        .into());
    }

    let mut command = Command::new(std::env::current_exe()?);
    command
        .args(args.into_iter().map(Into::into))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: `new_session` only calls setsid(2), which is async-signal-safe.
    unsafe {
        command.pre_exec(new_session);
    }
    let child = command.spawn()?;
    info!(pid = child.id(), "Daemon detached");
    Ok(child.id())
}

/// Asks the running daemon to stop gracefully; returns its PID
///
/// # Errors
///
/// Returns `NotRunning` when no live daemon is recorded.
pub fn shutdown(pid_file: &PidFile) -> WorkerResult<u32> {
    let pid = pid_file.running_daemon()?;
    signals::send(pid, Signal::Terminate)?;
    info!(pid, "Shutdown requested");
    Ok(pid)
}

/// Asks the running daemon for a rolling restart; returns its PID
///
/// # Errors
///
/// Returns `NotRunning` when no live daemon is recorded.
pub fn restart(pid_file: &PidFile) -> WorkerResult<u32> {
    let pid = pid_file.running_daemon()?;
    signals::send(pid, Signal::Hangup)?;
    info!(pid, "Restart requested");
    Ok(pid)
}

/// Reports what the PID record says
///
/// # Errors
///
/// Returns `Configuration` if the record is unreadable.
pub fn status(pid_file: &PidFile) -> WorkerResult<DaemonStatus> {
    Ok(match pid_file.read()? {
        None => DaemonStatus::NotRunning,
        Some(pid) if signals::is_alive(pid) => DaemonStatus::Running(pid),
        Some(pid) => DaemonStatus::Stale(pid),
    })
}

//! Worker process spawning.
//!
//! Every worker is an independent OS process. The supervisor only sees the
//! [`Spawner`] and [`WorkerProcess`] traits, so the supervision loop can be
//! driven by real children or by an in-memory fake.

use async_trait::async_trait;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};

use crate::EXIT_ABORT;
use crate::signals::{self, Signal};

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Exited with a status code
    Code(i32),
    /// Killed by a signal
    Signaled(i32),
}

impl Exit {
    /// Returns true if the worker reported a startup abort
    #[must_use]
    pub fn is_abort(self) -> bool {
        self == Self::Code(EXIT_ABORT)
    }
}

impl From<ExitStatus> for Exit {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self::Code(code),
            None => Self::Signaled(status.signal().unwrap_or_default()),
        }
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signaled(sig) => write!(f, "signal {sig}"),
        }
    }
}

/// A live worker process owned by the supervisor
#[async_trait]
pub trait WorkerProcess: Send {
    /// OS process id
    fn pid(&self) -> u32;

    /// Non-blocking liveness check; `Some` once the process has exited
    fn try_exit(&mut self) -> io::Result<Option<Exit>>;

    /// Sends a signal to the process
    fn signal(&self, signal: Signal) -> io::Result<()>;

    /// Waits up to `timeout` for the process to exit
    async fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<Exit>>;
}

/// Creates worker processes
pub trait Spawner: Send + Sync {
    /// Process type produced
    type Process: WorkerProcess;

    /// Starts one worker
    fn spawn(&self) -> io::Result<Self::Process>;
}

/// Spawns workers by running a command, normally this binary's `work`
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandSpawner {
    /// Spawner for an arbitrary program
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Spawner that re-executes the running binary
    ///
    /// # Errors
    ///
    /// Returns an error if the current executable cannot be located.
    pub fn current_exe<I, S>(args: I) -> io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Ok(Self::new(std::env::current_exe()?, args))
    }
}

impl Spawner for CommandSpawner {
    type Process = ChildWorker;

    fn spawn(&self) -> io::Result<ChildWorker> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null()).kill_on_drop(false);
        // SAFETY: `new_session` only calls setsid(2), which is async-signal-safe.
        unsafe {
            command.pre_exec(new_session);
        }
        let child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("spawned worker has no pid"))?;
        Ok(ChildWorker { child, pid })
    }
}

/// Detaches the calling process into a new session and process group.
///
/// Runs in the forked child before exec: the child loses the controlling
/// terminal, so job-control signals reach the daemon only.
pub(crate) fn new_session() -> io::Result<()> {
    // SAFETY: setsid(2) takes no arguments and has no memory effects.
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A worker running as a child process
#[derive(Debug)]
pub struct ChildWorker {
    child: Child,
    pid: u32,
}

#[async_trait]
impl WorkerProcess for ChildWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit(&mut self) -> io::Result<Option<Exit>> {
        Ok(self.child.try_wait()?.map(Exit::from))
    }

    fn signal(&self, signal: Signal) -> io::Result<()> {
        signals::send(self.pid, signal)
    }

    async fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<Exit>> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => Ok(Some(Exit::from(status?))),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_spawn_and_reap_exit_code() {
        let spawner = CommandSpawner::new("sh", ["-c", "exit 3"]);
        let mut child = spawner.spawn().unwrap();
        assert!(child.pid() > 0);

        let exit = child.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit, Some(Exit::Code(EXIT_ABORT)));
        assert!(exit.unwrap().is_abort());
    }

    #[tokio::test]
    async fn test_signal_terminates_child() {
        let spawner = CommandSpawner::new("sleep", ["30"]);
        let mut child = spawner.spawn().unwrap();
        assert_eq!(child.try_exit().unwrap(), None);

        child.signal(Signal::Terminate).unwrap();
        let exit = child.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit, Some(Exit::Signaled(libc::SIGTERM)));
    }

    #[tokio::test]
    async fn test_wait_timeout_expires() {
        let spawner = CommandSpawner::new("sleep", ["30"]);
        let mut child = spawner.spawn().unwrap();
        let exit = child.wait_timeout(Duration::from_millis(50)).await.unwrap();
        assert_eq!(exit, None);

        child.signal(Signal::Kill).unwrap();
        let exit = child.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit, Some(Exit::Signaled(libc::SIGKILL)));
    }

    #[tokio::test]
    async fn test_worker_leads_its_own_session() {
        let spawner = CommandSpawner::new("sleep", ["30"]);
        let mut child = spawner.spawn().unwrap();
        let pid = libc::pid_t::try_from(child.pid()).unwrap();

        let sid = unsafe { libc::getsid(pid) };
        let pgid = unsafe { libc::getpgid(pid) };
        let own_sid = unsafe { libc::getsid(0) };

        child.signal(Signal::Kill).unwrap();
        child.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(sid, pid);
        assert_eq!(pgid, pid);
        assert_ne!(sid, own_sid);
    }

    #[tokio::test]
    async fn test_stdin_is_closed() {
        let spawner = CommandSpawner::new("sh", ["-c", "read line || exit 0; exit 1"]);
        let mut child = spawner.spawn().unwrap();
        let exit = child.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit, Some(Exit::Code(0)));
    }
}

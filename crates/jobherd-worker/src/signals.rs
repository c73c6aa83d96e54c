//! OS signal handling.
//!
//! Each handled signal maps to one [`Intent`]. Listeners run as tokio tasks
//! and do nothing but apply the intent to [`ProcessFlags`]; the owning loop
//! acts on the flags at its own checkpoints.
//!
//! | Signal                  | Daemon        | Worker / Scheduler |
//! |-------------------------|---------------|--------------------|
//! | SIGTERM, SIGINT, SIGQUIT| Stop          | Stop               |
//! | SIGHUP                  | Reload        | ignored            |
//! | SIGUSR2                 | Abort         | ignored            |
//! | SIGTTIN / SIGTTOU       | Grow / Shrink | ignored            |

use std::io;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{Instrument, info};

use crate::state::{ProcessFlags, Role};

/// What a signal asks the process to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Finish the current work and exit
    Stop,
    /// Replace the worker pool
    Reload,
    /// A worker failed to start; stop with a non-zero exit code
    Abort,
    /// Add one worker to the pool
    Grow,
    /// Remove one worker from the pool
    Shrink,
}

/// Signals jobherd sends or listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM
    Terminate,
    /// SIGINT
    Interrupt,
    /// SIGQUIT
    Quit,
    /// SIGHUP
    Hangup,
    /// SIGUSR2
    User2,
    /// SIGTTIN
    TtyIn,
    /// SIGTTOU
    TtyOut,
    /// SIGKILL
    Kill,
}

impl Signal {
    const LISTENED: [Signal; 7] = [
        Self::Terminate,
        Self::Interrupt,
        Self::Quit,
        Self::Hangup,
        Self::User2,
        Self::TtyIn,
        Self::TtyOut,
    ];

    /// Raw signal number
    #[must_use]
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Self::Terminate => libc::SIGTERM,
            Self::Interrupt => libc::SIGINT,
            Self::Quit => libc::SIGQUIT,
            Self::Hangup => libc::SIGHUP,
            Self::User2 => libc::SIGUSR2,
            Self::TtyIn => libc::SIGTTIN,
            Self::TtyOut => libc::SIGTTOU,
            Self::Kill => libc::SIGKILL,
        }
    }
}

/// Maps a signal to the intent it carries for a role
#[must_use]
pub fn intent_for(role: Role, signal: Signal) -> Option<Intent> {
    match (signal, role) {
        (Signal::Terminate | Signal::Interrupt | Signal::Quit, _) => Some(Intent::Stop),
        (Signal::Hangup, Role::Daemon) => Some(Intent::Reload),
        (Signal::User2, Role::Daemon) => Some(Intent::Abort),
        (Signal::TtyIn, Role::Daemon) => Some(Intent::Grow),
        (Signal::TtyOut, Role::Daemon) => Some(Intent::Shrink),
        _ => None,
    }
}

/// Starts listening for every signal meaningful to the flags' role
///
/// # Errors
///
/// Returns an error if a signal stream cannot be registered.
pub fn install(flags: &Arc<ProcessFlags>) -> io::Result<()> {
    let role = flags.role();
    for sig in Signal::LISTENED {
        let Some(intent) = intent_for(role, sig) else {
            continue;
        };
        let mut stream = signal(SignalKind::from_raw(sig.as_raw()))?;
        let flags = Arc::clone(flags);
        tokio::spawn(
            async move {
                while stream.recv().await.is_some() {
                    info!(signal = ?sig, intent = ?intent, "Signal received");
                    flags.apply(intent);
                }
            }
            .in_current_span(),
        );
    }
    Ok(())
}

/// Sends a signal to a process
///
/// # Errors
///
/// Returns the OS error from `kill(2)`, or `InvalidInput` for PID 0.
pub fn send(pid: u32, signal: Signal) -> io::Result<()> {
    kill(pid, signal.as_raw())
}

/// Returns true if a process with this PID exists
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    match kill(pid, 0) {
        Ok(()) => true,
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}

fn kill(pid: u32, sig: libc::c_int) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}")))?;
    // SAFETY: kill(2) takes plain integers and has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Mutex;

    #[rstest]
    #[case(Role::Daemon, Signal::Terminate, Some(Intent::Stop))]
    #[case(Role::Daemon, Signal::Hangup, Some(Intent::Reload))]
    #[case(Role::Daemon, Signal::User2, Some(Intent::Abort))]
    #[case(Role::Daemon, Signal::TtyIn, Some(Intent::Grow))]
    #[case(Role::Daemon, Signal::TtyOut, Some(Intent::Shrink))]
    #[case(Role::Worker, Signal::Interrupt, Some(Intent::Stop))]
    #[case(Role::Worker, Signal::Hangup, None)]
    #[case(Role::Worker, Signal::User2, None)]
    #[case(Role::Scheduler, Signal::Quit, Some(Intent::Stop))]
    #[case(Role::Scheduler, Signal::TtyIn, None)]
    fn test_intent_mapping(#[case] role: Role, #[case] signal: Signal, #[case] expected: Option<Intent>) {
        assert_eq!(intent_for(role, signal), expected);
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_pid_zero_rejected() {
        assert!(!is_alive(0));
        let err = send(0, Signal::Terminate).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_installed_listener_sets_flags() {
        let flags = ProcessFlags::new(Role::Daemon);
        install(&flags).unwrap();

        send(std::process::id(), Signal::TtyIn).unwrap();
        for _ in 0..100 {
            if flags.take_resize() >= 1 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("grow intent was not applied");
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_listener_logs_inside_process_span() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let flags = ProcessFlags::new(Role::Daemon);
        {
            let _span = tracing::info_span!("process", role = "daemon").entered();
            install(&flags).unwrap();
        }

        send(std::process::id(), Signal::TtyIn).unwrap();
        for _ in 0..100 {
            if flags.take_resize() >= 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line = output
            .lines()
            .find(|line| line.contains("Signal received"))
            .unwrap_or_else(|| panic!("no signal line in {output:?}"));
        assert!(line.contains("role=\"daemon\""), "{line}");
    }
}

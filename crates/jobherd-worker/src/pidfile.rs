//! PID record.
//!
//! A plain-text file holding the daemon's process id. It is how `start`
//! detects a daemon that is already running and how `shutdown` and
//! `restart` find the process to signal.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::{WorkerError, WorkerErrorKind, WorkerResult, signals};

/// PID record at a fixed path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Creates a handle; nothing is touched on disk
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the record
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the recorded PID, `None` if there is no record
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the file is unreadable or does not hold a PID.
    pub fn read(&self) -> WorkerResult<Option<u32>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(WorkerError::configuration(format!(
                    "cannot read pid file {}: {e}",
                    self.path.display()
                )));
            }
        };
        content.trim().parse::<u32>().map(Some).map_err(|_| {
            WorkerError::configuration(format!(
                "pid file {} does not contain a process id",
                self.path.display()
            ))
        })
    }

    /// Checks that the record's directory exists and is writable
    ///
    /// # Errors
    ///
    /// Returns `Configuration` describing the missing prerequisite.
    pub fn check_writable(&self) -> WorkerResult<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let metadata = fs::metadata(&dir).map_err(|e| {
            WorkerError::configuration(format!("pid directory {} unavailable: {e}", dir.display()))
        })?;
        if !metadata.is_dir() {
            return Err(WorkerError::configuration(format!(
                "pid directory {} is not a directory",
                dir.display()
            )));
        }
        if metadata.permissions().readonly() {
            return Err(WorkerError::configuration(format!(
                "pid directory {} is not writable",
                dir.display()
            )));
        }
        Ok(())
    }

    /// Records `pid`, refusing if a live daemon is already recorded.
    ///
    /// A record left behind by a dead process is replaced.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` for a live record and `Configuration` if the
    /// file cannot be written.
    pub fn acquire(&self, pid: u32) -> WorkerResult<()> {
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&self.path) {
                Ok(mut file) => {
                    writeln!(file, "{pid}").map_err(|e| self.write_error(&e))?;
                    debug!(pid, path = %self.path.display(), "PID record written");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let recorded = self.read()?;
                    if let Some(existing) = recorded.filter(|p| signals::is_alive(*p)) {
                        return Err(WorkerErrorKind::AlreadyRunning {
                            pid: existing,
                            path: self.path.clone(),
                        }
                        .into());
                    }
                    warn!(path = %self.path.display(), stale = ?recorded, "Replacing stale PID record");
                    self.remove()?;
                }
                Err(e) => return Err(self.write_error(&e)),
            }
        }
        Err(WorkerError::configuration(format!(
            "could not create pid file {}",
            self.path.display()
        )))
    }

    /// PID of the running daemon, for shutdown and restart
    ///
    /// # Errors
    ///
    /// Returns `NotRunning` when there is no record or the recorded process is
    /// gone. A stale record is left in place for manual cleanup.
    pub fn running_daemon(&self) -> WorkerResult<u32> {
        let not_running = |reason: String| -> WorkerError {
            WorkerErrorKind::NotRunning {
                reason,
                path: self.path.clone(),
            }
            .into()
        };
        match self.read()? {
            None => Err(not_running("no pid record".to_string())),
            Some(pid) if signals::is_alive(pid) => Ok(pid),
            Some(pid) => Err(not_running(format!(
                "stale pid record for process {pid}, remove it manually"
            ))),
        }
    }

    /// Deletes the record; a missing record is not an error
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file exists but cannot be removed.
    pub fn remove(&self) -> WorkerResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_error(&self, e: &io::Error) -> WorkerError {
        WorkerError::configuration(format!("cannot write pid file {}: {e}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // Far above any default pid_max, so never alive.
    const DEAD_PID: u32 = 999_999_999;

    fn pid_file(dir: &tempfile::TempDir) -> PidFile {
        PidFile::new(dir.path().join("jobherd.pid"))
    }

    #[test]
    fn test_acquire_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = pid_file(&dir);
        assert_eq!(pid_file.read().unwrap(), None);

        pid_file.acquire(std::process::id()).unwrap();
        assert_eq!(pid_file.read().unwrap(), Some(std::process::id()));
        assert_eq!(pid_file.running_daemon().unwrap(), std::process::id());

        pid_file.remove().unwrap();
        assert_eq!(pid_file.read().unwrap(), None);
        pid_file.remove().unwrap();
    }

    #[test]
    fn test_acquire_refuses_live_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = pid_file(&dir);
        pid_file.acquire(std::process::id()).unwrap();

        let err = pid_file.acquire(12345).unwrap_err();
        assert!(matches!(err.kind(), WorkerErrorKind::AlreadyRunning { .. }));
        assert_eq!(pid_file.read().unwrap(), Some(std::process::id()));
    }

    #[test]
    fn test_acquire_replaces_stale_record() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = pid_file(&dir);
        fs::write(pid_file.path(), format!("{DEAD_PID}\n")).unwrap();

        pid_file.acquire(std::process::id()).unwrap();
        assert_eq!(pid_file.read().unwrap(), Some(std::process::id()));
    }

    #[test]
    fn test_running_daemon_without_record() {
        let dir = tempfile::tempdir().unwrap();
        let err = pid_file(&dir).running_daemon().unwrap_err();
        assert!(matches!(err.kind(), WorkerErrorKind::NotRunning { .. }));
    }

    #[test]
    fn test_running_daemon_with_stale_record_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = pid_file(&dir);
        fs::write(pid_file.path(), DEAD_PID.to_string()).unwrap();

        let err = pid_file.running_daemon().unwrap_err();
        assert!(matches!(err.kind(), WorkerErrorKind::NotRunning { .. }));
        assert!(pid_file.path().exists());
    }

    #[test]
    fn test_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = pid_file(&dir);
        fs::write(pid_file.path(), "not-a-pid").unwrap();
        assert!(matches!(
            pid_file.read().unwrap_err().kind(),
            WorkerErrorKind::Configuration { .. }
        ));
    }

    #[test]
    fn test_check_writable() {
        let dir = tempfile::tempdir().unwrap();
        pid_file(&dir).check_writable().unwrap();

        let missing = PidFile::new(dir.path().join("missing/jobherd.pid"));
        assert!(matches!(
            missing.check_writable().unwrap_err().kind(),
            WorkerErrorKind::Configuration { .. }
        ));
    }
}

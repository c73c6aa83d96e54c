//! Process state tracking.
//!
//! [`ProcessFlags`] is the per-process control state written by signal
//! listeners and read by the owning loop at well-defined checkpoints.
//! [`WorkerPoolState`] is the supervisor's bookkeeping of its children.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::signals::Intent;

/// Longest uninterrupted sleep in [`ProcessFlags::sleep`]
const STOP_CHECK: Duration = Duration::from_millis(100);

/// Which kind of process owns the flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The supervising parent
    Daemon,
    /// A job-executing child
    Worker,
    /// The delayed-job promoter
    Scheduler,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Daemon => write!(f, "daemon"),
            Self::Worker => write!(f, "worker"),
            Self::Scheduler => write!(f, "scheduler"),
        }
    }
}

/// Lifecycle of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Normal operation
    Running,
    /// A reload has been requested and not yet carried out
    Reloading,
    /// Stop requested; children are being retired
    Stopping,
    /// Terminal
    Stopped,
}

/// Per-process control flags
#[derive(Debug)]
pub struct ProcessFlags {
    role: Role,
    running: AtomicBool,
    reload_requested: AtomicBool,
    stopped: AtomicBool,
    exit_code: AtomicI32,
    resize: AtomicI64,
}

impl ProcessFlags {
    /// Creates flags for a freshly started process
    #[must_use]
    pub fn new(role: Role) -> Arc<Self> {
        Arc::new(Self {
            role,
            running: AtomicBool::new(true),
            reload_requested: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            resize: AtomicI64::new(0),
        })
    }

    /// Returns the role of this process
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns false once a stop has been requested
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests a graceful stop
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Requests a reload; returns false when the request is ignored.
    ///
    /// Only a running daemon reloads. A request made while a previous one is
    /// still pending is absorbed by it.
    pub fn request_reload(&self) -> bool {
        if self.role != Role::Daemon || !self.is_running() {
            return false;
        }
        !self.reload_requested.swap(true, Ordering::SeqCst)
    }

    /// Returns true if a reload is pending
    #[must_use]
    pub fn reload_requested(&self) -> bool {
        self.reload_requested.load(Ordering::SeqCst)
    }

    /// Marks the pending reload as carried out
    pub fn clear_reload(&self) {
        self.reload_requested.store(false, Ordering::SeqCst);
    }

    /// Forces a stop with a non-zero exit code, overriding any pending reload
    pub fn request_abort(&self) {
        self.exit_code.store(1, Ordering::SeqCst);
        self.reload_requested.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    /// Exit code the process should terminate with
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    /// Queues a change of the desired pool size
    pub fn request_resize(&self, delta: i64) {
        self.resize.fetch_add(delta, Ordering::SeqCst);
    }

    /// Takes the queued pool size change
    pub fn take_resize(&self) -> i64 {
        self.resize.swap(0, Ordering::SeqCst)
    }

    /// Marks the process as fully stopped
    pub fn mark_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Current lifecycle state
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        if self.stopped.load(Ordering::SeqCst) {
            Lifecycle::Stopped
        } else if !self.is_running() {
            Lifecycle::Stopping
        } else if self.reload_requested() {
            Lifecycle::Reloading
        } else {
            Lifecycle::Running
        }
    }

    /// Sleeps up to `duration`, returning early once a stop is requested
    pub async fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while self.is_running() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(remaining.min(STOP_CHECK)).await;
        }
    }

    /// Applies an intent delivered by a signal
    pub fn apply(&self, intent: Intent) {
        match intent {
            Intent::Stop => self.request_stop(),
            Intent::Reload => {
                self.request_reload();
            }
            Intent::Abort => self.request_abort(),
            Intent::Grow => self.request_resize(1),
            Intent::Shrink => self.request_resize(-1),
        }
    }
}

/// Bookkeeping of the supervisor's live children
#[derive(Debug)]
pub struct WorkerPoolState<P> {
    desired: usize,
    started: u64,
    active: VecDeque<P>,
}

impl<P> WorkerPoolState<P> {
    /// Creates an empty pool targeting `desired` workers
    #[must_use]
    pub fn new(desired: usize) -> Self {
        Self {
            desired,
            started: 0,
            active: VecDeque::new(),
        }
    }

    /// Target number of concurrently running workers
    #[must_use]
    pub fn desired(&self) -> usize {
        self.desired
    }

    /// Applies a signed change to the target size, never below zero
    pub fn adjust_desired(&mut self, delta: i64) {
        let magnitude = usize::try_from(delta.unsigned_abs()).unwrap_or(usize::MAX);
        self.desired = if delta >= 0 {
            self.desired.saturating_add(magnitude)
        } else {
            self.desired.saturating_sub(magnitude)
        };
    }

    /// Cumulative number of workers ever spawned
    #[must_use]
    pub fn started(&self) -> u64 {
        self.started
    }

    /// Number of tracked live workers
    #[must_use]
    pub fn alive(&self) -> usize {
        self.active.len()
    }

    /// Tracks a newly spawned worker as the youngest
    pub fn push(&mut self, process: P) {
        self.started += 1;
        self.active.push_back(process);
    }

    /// Removes the oldest-spawned worker
    pub fn pop_oldest(&mut self) -> Option<P> {
        self.active.pop_front()
    }

    /// Drops every worker for which `still_alive` returns false
    pub fn retain_alive(&mut self, still_alive: impl FnMut(&mut P) -> bool) {
        self.active.retain_mut(still_alive);
    }

    /// Iterates live workers from oldest to youngest
    pub fn iter(&self) -> impl Iterator<Item = &P> {
        self.active.iter()
    }
}

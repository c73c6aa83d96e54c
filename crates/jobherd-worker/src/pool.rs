//! Worker pool supervision.
//!
//! The [`Supervisor`] is the daemon's main loop. It never blocks on a worker
//! except for the bounded wait after asking one to terminate; everything else
//! is non-blocking reaping, signalling and a short sleep per tick.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::process::{Spawner, WorkerProcess};
use crate::signals::Signal;
use crate::state::{ProcessFlags, WorkerPoolState};
use crate::{WorkerError, WorkerErrorKind};

/// Wait for the exit status after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Supervisor configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Desired number of concurrently running workers
    pub workers: usize,
    /// Total number of spawns allowed over the daemon's life, 0 for unlimited
    pub limit: u64,
    /// Replace workers that exit
    pub resuscitate: bool,
    /// One job per worker process
    pub atomic: bool,
    /// Workers block on the broker while waiting for a job
    pub blocking: bool,
    /// Sleep between loop iterations
    pub tick: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub shutdown_timeout: Duration,
    /// Grace period for blocking-mode workers
    pub blocking_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            limit: 0,
            resuscitate: false,
            atomic: false,
            blocking: false,
            tick: Duration::from_millis(150),
            shutdown_timeout: Duration::from_secs(30),
            blocking_grace: Duration::from_secs(2),
        }
    }
}

impl SupervisorConfig {
    /// Applies the implications of atomic mode
    #[must_use]
    pub fn effective(mut self) -> Self {
        if self.atomic {
            self.resuscitate = true;
        }
        self
    }

    /// How long a terminated worker is given before it is killed
    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        if self.blocking {
            self.blocking_grace
        } else {
            self.shutdown_timeout
        }
    }
}

/// Owns the worker pool for the lifetime of the daemon
pub struct Supervisor<S: Spawner> {
    config: SupervisorConfig,
    spawner: S,
    flags: Arc<ProcessFlags>,
    pool: WorkerPoolState<S::Process>,
}

impl<S: Spawner> Supervisor<S> {
    /// Creates a supervisor; no worker is started before [`Supervisor::run`]
    pub fn new(config: SupervisorConfig, spawner: S, flags: Arc<ProcessFlags>) -> Self {
        let config = config.effective();
        let pool = WorkerPoolState::new(config.workers);
        Self {
            config,
            spawner,
            flags,
            pool,
        }
    }

    /// Flags driving this supervisor
    #[must_use]
    pub fn flags(&self) -> &Arc<ProcessFlags> {
        &self.flags
    }

    /// Current pool bookkeeping
    #[must_use]
    pub fn pool(&self) -> &WorkerPoolState<S::Process> {
        &self.pool
    }

    /// Runs the supervision loop until a stop is requested.
    ///
    /// Returns the exit code the daemon should terminate with.
    pub async fn run(&mut self) -> i32 {
        info!(
            workers = self.config.workers,
            limit = self.config.limit,
            resuscitate = self.config.resuscitate,
            atomic = self.config.atomic,
            blocking = self.config.blocking,
            "Supervisor starting"
        );

        self.fill();
        while self.flags.is_running() {
            tokio::time::sleep(self.config.tick).await;
            self.step().await;
        }

        info!(alive = self.pool.alive(), "Stopping workers");
        self.terminate_all().await;
        self.flags.mark_stopped();

        let exit_code = self.flags.exit_code();
        info!(exit_code, started = self.pool.started(), "Supervisor stopped");
        exit_code
    }

    /// One iteration of the loop body
    async fn step(&mut self) {
        let delta = self.flags.take_resize();
        if delta != 0 {
            self.pool.adjust_desired(delta);
            info!(desired = self.pool.desired(), "Pool size changed");
        }

        if self.flags.reload_requested() {
            self.reload().await;
            return;
        }

        self.reap();
        if !self.flags.is_running() {
            return;
        }

        self.shrink().await;
        if self.config.resuscitate {
            self.fill();
        } else if self.pool.alive() == 0 {
            info!("All workers have exited");
            self.flags.request_stop();
        }
    }

    /// Terminates the whole pool and starts a single fresh worker
    async fn reload(&mut self) {
        info!(alive = self.pool.alive(), "Reload requested, restarting workers");
        self.terminate_all().await;
        if self.flags.is_running() {
            self.spawn_one();
        }
        // Cleared last so a request arriving mid-reload is absorbed.
        self.flags.clear_reload();
        debug!("Reload complete");
    }

    /// Forgets workers that have exited
    fn reap(&mut self) {
        let flags = &self.flags;
        self.pool.retain_alive(|worker| match worker.try_exit() {
            Ok(None) => true,
            Ok(Some(exit)) if exit.is_abort() => {
                error!(pid = worker.pid(), %exit, "Worker failed to start, aborting");
                flags.request_abort();
                false
            }
            Ok(Some(exit)) => {
                info!(pid = worker.pid(), %exit, "Worker exited");
                false
            }
            Err(e) => {
                warn!(pid = worker.pid(), error = %e, "Lost track of worker");
                false
            }
        });
    }

    /// Retires excess workers, oldest first
    async fn shrink(&mut self) {
        while self.pool.alive() > self.pool.desired() {
            let Some(mut worker) = self.pool.pop_oldest() else {
                break;
            };
            info!(pid = worker.pid(), "Retiring worker");
            Self::send(&worker, Signal::Terminate);
            self.await_exit(&mut worker).await;
        }
    }

    /// Spawns workers up to the desired count, honouring the restart limit
    fn fill(&mut self) {
        while self.flags.is_running() && self.pool.alive() < self.pool.desired() {
            let limit = self.config.limit;
            if limit > 0 && self.pool.started() >= limit {
                let err = WorkerError::from(WorkerErrorKind::RestartLimitExceeded { limit });
                warn!(error = %err, started = self.pool.started(), "Not spawning more workers");
                self.flags.request_stop();
                return;
            }
            if !self.spawn_one() {
                return;
            }
        }
    }

    fn spawn_one(&mut self) -> bool {
        match self.spawner.spawn() {
            Ok(worker) => {
                info!(pid = worker.pid(), started = self.pool.started() + 1, "Worker spawned");
                self.pool.push(worker);
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to spawn worker");
                false
            }
        }
    }

    /// Signals every worker, then waits for each in spawn order
    async fn terminate_all(&mut self) {
        let mut workers = Vec::with_capacity(self.pool.alive());
        while let Some(worker) = self.pool.pop_oldest() {
            Self::send(&worker, Signal::Terminate);
            workers.push(worker);
        }
        for mut worker in workers {
            self.await_exit(&mut worker).await;
        }
    }

    async fn await_exit(&self, worker: &mut S::Process) {
        let pid = worker.pid();
        match worker.wait_timeout(self.config.stop_timeout()).await {
            Ok(Some(exit)) => {
                info!(pid, %exit, "Worker stopped");
                return;
            }
            Ok(None) => warn!(pid, "Worker did not stop in time, killing it"),
            Err(e) => warn!(pid, error = %e, "Waiting for worker failed, killing it"),
        }
        Self::send(worker, Signal::Kill);
        match worker.wait_timeout(KILL_WAIT).await {
            Ok(Some(exit)) => info!(pid, %exit, "Worker killed"),
            Ok(None) => error!(pid, "Worker survived SIGKILL"),
            Err(e) => error!(pid, error = %e, "Could not reap killed worker"),
        }
    }

    fn send(worker: &S::Process, signal: Signal) {
        if let Err(e) = worker.signal(signal) {
            // The worker may already be gone; its status is still reaped.
            debug!(pid = worker.pid(), ?signal, error = %e, "Signal not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Exit;
    use crate::state::{Lifecycle, Role};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct FakeState {
        next_pid: u32,
        spawned: Vec<u32>,
        terminated: Vec<u32>,
        exits: HashMap<u32, Exit>,
        exit_on_spawn: Option<Exit>,
        ignore_term: bool,
    }

    #[derive(Debug, Clone, Default)]
    struct FakeSpawner(Arc<Mutex<FakeState>>);

    impl FakeSpawner {
        fn exiting_with(exit: Exit) -> Self {
            let spawner = Self::default();
            spawner.0.lock().unwrap().exit_on_spawn = Some(exit);
            spawner
        }

        fn spawned(&self) -> Vec<u32> {
            self.0.lock().unwrap().spawned.clone()
        }

        fn terminated(&self) -> Vec<u32> {
            self.0.lock().unwrap().terminated.clone()
        }

        fn exit(&self, pid: u32, exit: Exit) {
            self.0.lock().unwrap().exits.insert(pid, exit);
        }
    }

    struct FakeProcess {
        pid: u32,
        state: Arc<Mutex<FakeState>>,
    }

    impl Spawner for FakeSpawner {
        type Process = FakeProcess;

        fn spawn(&self) -> io::Result<FakeProcess> {
            let mut state = self.0.lock().unwrap();
            state.next_pid += 1;
            let pid = state.next_pid;
            state.spawned.push(pid);
            if let Some(exit) = state.exit_on_spawn {
                state.exits.insert(pid, exit);
            }
            Ok(FakeProcess {
                pid,
                state: Arc::clone(&self.0),
            })
        }
    }

    #[async_trait]
    impl WorkerProcess for FakeProcess {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn try_exit(&mut self) -> io::Result<Option<Exit>> {
            Ok(self.state.lock().unwrap().exits.get(&self.pid).copied())
        }

        fn signal(&self, signal: Signal) -> io::Result<()> {
            let mut state = self.state.lock().unwrap();
            match signal {
                Signal::Terminate => {
                    state.terminated.push(self.pid);
                    if !state.ignore_term {
                        state.exits.entry(self.pid).or_insert(Exit::Signaled(libc::SIGTERM));
                    }
                }
                Signal::Kill => {
                    state.exits.entry(self.pid).or_insert(Exit::Signaled(libc::SIGKILL));
                }
                _ => {}
            }
            Ok(())
        }

        async fn wait_timeout(&mut self, _timeout: Duration) -> io::Result<Option<Exit>> {
            self.try_exit()
        }
    }

    fn config(workers: usize) -> SupervisorConfig {
        SupervisorConfig {
            workers,
            tick: Duration::from_millis(1),
            shutdown_timeout: Duration::from_millis(10),
            blocking_grace: Duration::from_millis(10),
            ..SupervisorConfig::default()
        }
    }

    fn alive_pids(supervisor: &Supervisor<FakeSpawner>) -> Vec<u32> {
        supervisor.pool().iter().map(WorkerProcess::pid).collect()
    }

    #[test]
    fn test_supervisor_config_default() {
        let config = SupervisorConfig::default();
        assert_eq!(config.workers, 1);
        assert_eq!(config.limit, 0);
        assert_eq!(config.tick, Duration::from_millis(150));
        assert_eq!(config.stop_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_atomic_implies_resuscitate() {
        let config = SupervisorConfig {
            atomic: true,
            limit: 3,
            ..SupervisorConfig::default()
        }
        .effective();
        assert!(config.resuscitate);
        assert_eq!(config.limit, 3);
    }

    #[test]
    fn test_blocking_workers_get_short_grace() {
        let config = SupervisorConfig {
            blocking: true,
            ..SupervisorConfig::default()
        };
        assert_eq!(config.stop_timeout(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_pool_stabilizes_at_desired_count() {
        let spawner = FakeSpawner::default();
        let mut supervisor = Supervisor::new(
            SupervisorConfig {
                resuscitate: true,
                ..config(3)
            },
            spawner.clone(),
            ProcessFlags::new(Role::Daemon),
        );

        supervisor.fill();
        supervisor.step().await;
        assert_eq!(alive_pids(&supervisor), vec![1, 2, 3]);

        spawner.exit(2, Exit::Code(0));
        supervisor.step().await;
        assert_eq!(alive_pids(&supervisor), vec![1, 3, 4]);
        assert_eq!(supervisor.pool().started(), 4);
    }

    #[tokio::test]
    async fn test_zero_workers_is_a_valid_pool() {
        let mut supervisor = Supervisor::new(
            SupervisorConfig {
                resuscitate: true,
                ..config(0)
            },
            FakeSpawner::default(),
            ProcessFlags::new(Role::Daemon),
        );
        supervisor.fill();
        supervisor.step().await;
        assert_eq!(supervisor.pool().alive(), 0);
        assert!(supervisor.flags().is_running());
    }

    #[tokio::test]
    async fn test_shrink_retires_oldest_first() {
        let spawner = FakeSpawner::default();
        let flags = ProcessFlags::new(Role::Daemon);
        let mut supervisor = Supervisor::new(config(4), spawner.clone(), Arc::clone(&flags));

        supervisor.fill();
        flags.request_resize(-3);
        supervisor.step().await;

        assert_eq!(spawner.terminated(), vec![1, 2, 3]);
        assert_eq!(alive_pids(&supervisor), vec![4]);
    }

    #[tokio::test]
    async fn test_grow_spawns_when_resuscitating() {
        let spawner = FakeSpawner::default();
        let flags = ProcessFlags::new(Role::Daemon);
        let mut supervisor = Supervisor::new(
            SupervisorConfig {
                resuscitate: true,
                ..config(1)
            },
            spawner.clone(),
            Arc::clone(&flags),
        );

        supervisor.fill();
        flags.request_resize(2);
        supervisor.step().await;
        assert_eq!(spawner.spawned(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_restart_limit_stops_after_last_allowed_spawn() {
        let spawner = FakeSpawner::exiting_with(Exit::Code(0));
        let flags = ProcessFlags::new(Role::Daemon);
        let mut supervisor = Supervisor::new(
            SupervisorConfig {
                atomic: true,
                limit: 3,
                ..config(1)
            },
            spawner.clone(),
            Arc::clone(&flags),
        );

        let exit_code = supervisor.run().await;
        assert_eq!(exit_code, 0);
        assert_eq!(spawner.spawned(), vec![1, 2, 3]);
        assert_eq!(flags.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn test_double_reload_restarts_once() {
        let spawner = FakeSpawner::default();
        let flags = ProcessFlags::new(Role::Daemon);
        let mut supervisor = Supervisor::new(config(2), spawner.clone(), Arc::clone(&flags));

        supervisor.fill();
        assert!(flags.request_reload());
        assert!(!flags.request_reload());

        supervisor.step().await;
        assert_eq!(spawner.terminated(), vec![1, 2]);
        assert_eq!(alive_pids(&supervisor), vec![3]);
        assert_eq!(flags.lifecycle(), Lifecycle::Running);

        supervisor.step().await;
        assert_eq!(spawner.spawned(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_worker_abort_exits_with_failure() {
        let spawner = FakeSpawner::exiting_with(Exit::Code(crate::EXIT_ABORT));
        let flags = ProcessFlags::new(Role::Daemon);
        let mut supervisor = Supervisor::new(
            SupervisorConfig {
                resuscitate: true,
                ..config(2)
            },
            spawner.clone(),
            Arc::clone(&flags),
        );

        assert_eq!(supervisor.run().await, 1);
        assert_eq!(spawner.spawned(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_stops_when_pool_empties_without_resuscitation() {
        let spawner = FakeSpawner::exiting_with(Exit::Code(0));
        let mut supervisor = Supervisor::new(config(2), spawner.clone(), ProcessFlags::new(Role::Daemon));

        assert_eq!(supervisor.run().await, 0);
        assert_eq!(spawner.spawned(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_stop_kills_workers_ignoring_sigterm() {
        let spawner = FakeSpawner::default();
        spawner.0.lock().unwrap().ignore_term = true;
        let flags = ProcessFlags::new(Role::Daemon);
        let mut supervisor = Supervisor::new(config(1), spawner.clone(), Arc::clone(&flags));

        supervisor.fill();
        flags.request_stop();
        supervisor.terminate_all().await;

        assert_eq!(spawner.terminated(), vec![1]);
        assert_eq!(
            spawner.0.lock().unwrap().exits.get(&1).copied(),
            Some(Exit::Signaled(libc::SIGKILL))
        );
        assert_eq!(supervisor.pool().alive(), 0);
    }
}
